use crate::{Error, Intrinsics, LocalizationOutcome, ScenePoint};
use core::fmt;
use core::str::FromStr;
use cv_core::nalgebra::{Point3, Vector3};
use cv_core::{Pose, WorldToCamera};
use log::*;
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// The suffix inserted before the extension of refined trajectory outputs.
pub const REFINED_SUFFIX: &str = "BUNDLE";

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];
const PLACEHOLDER_COLOR: [u8; 3] = [128, 128, 128];

/// Which trajectory of a run is being exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrajectoryVariant {
    /// The poses as localized frame by frame.
    Raw,
    /// The poses after the sequence refinement.
    Refined,
}

/// One exported frame of a trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryEntry {
    pub label: String,
    pub frame_index: usize,
    pub identifier: String,
    pub valid: bool,
    /// The identity for invalid frames.
    pub pose: WorldToCamera,
    pub intrinsics: Option<Intrinsics>,
}

impl From<&LocalizationOutcome> for TrajectoryEntry {
    fn from(outcome: &LocalizationOutcome) -> Self {
        Self {
            label: outcome.label(),
            frame_index: outcome.frame_index,
            identifier: outcome.identifier.clone(),
            valid: outcome.is_valid(),
            pose: outcome.export_pose(),
            intrinsics: outcome.intrinsics,
        }
    }
}

/// Persists a trajectory.
///
/// Exporters differ in what they can persist, callers must check the capabilities before
/// appending. Appending something an exporter can not persist is a no-op.
pub trait TrajectoryExporter {
    fn can_export_trajectory(&self) -> bool;

    fn can_export_points(&self) -> bool;

    fn append_entry(&mut self, entry: &TrajectoryEntry) -> Result<(), Error>;

    fn append_points(&mut self, points: &[ScenePoint]) -> Result<(), Error>;

    /// Completes the output. Nothing may be appended afterwards.
    fn finish(&mut self) -> Result<(), Error>;
}

/// Opens one exporter per trajectory variant.
///
/// The raw and refined variants must write to distinct outputs.
pub trait ExportTarget {
    fn open(&mut self, variant: TrajectoryVariant) -> Result<Box<dyn TrajectoryExporter>, Error>;
}

/// The file formats trajectories can be exported to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON object per frame, written as soon as the frame is localized.
    JsonLines,
    /// Camera frusta and scene points, written once the trajectory is complete.
    Ply,
    /// Nothing is exported.
    None,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonl" | "jsonlines" => Ok(ExportFormat::JsonLines),
            "ply" => Ok(ExportFormat::Ply),
            "none" => Ok(ExportFormat::None),
            _ => Err(Error::InvalidValue {
                what: "export format",
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::JsonLines => "json",
            ExportFormat::Ply => "ply",
            ExportFormat::None => "none",
        })
    }
}

/// Exports to files, the refined variant next to the raw one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExportTarget {
    path: PathBuf,
    format: ExportFormat,
}

impl FileExportTarget {
    pub fn new(path: impl Into<PathBuf>, format: ExportFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    /// The path of a variant, `out.json` for the raw trajectory and `out.BUNDLE.json` for the
    /// refined one.
    pub fn variant_path(&self, variant: TrajectoryVariant) -> PathBuf {
        match variant {
            TrajectoryVariant::Raw => self.path.clone(),
            TrajectoryVariant::Refined => {
                let stem = self
                    .path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let name = match self.path.extension() {
                    Some(extension) => format!(
                        "{}.{}.{}",
                        stem,
                        REFINED_SUFFIX,
                        extension.to_string_lossy()
                    ),
                    None => format!("{}.{}", stem, REFINED_SUFFIX),
                };
                self.path.with_file_name(name)
            }
        }
    }
}

impl ExportTarget for FileExportTarget {
    fn open(&mut self, variant: TrajectoryVariant) -> Result<Box<dyn TrajectoryExporter>, Error> {
        let path = self.variant_path(variant);
        Ok(match self.format {
            ExportFormat::JsonLines => Box::new(JsonLinesExporter::create(path)?),
            ExportFormat::Ply => Box::new(PlyExporter::new(path)),
            ExportFormat::None => Box::new(NoopExporter),
        })
    }
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    label: &'a str,
    frame: usize,
    identifier: &'a str,
    valid: bool,
    /// Row-major world to camera rotation.
    rotation: [[f64; 3]; 3],
    /// World to camera translation.
    translation: [f64; 3],
    /// The optical center in the world.
    center: [f64; 3],
    intrinsics: Option<&'a Intrinsics>,
}

/// Writes one JSON object per line, flushed after every entry.
#[derive(Debug)]
pub struct JsonLinesExporter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesExporter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let file = File::create(&path).map_err(|source| Error::Export {
            path: path.clone(),
            source,
        })?;
        info!("exporting trajectory to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn export_error(&self) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| Error::Export {
            path: self.path.clone(),
            source,
        }
    }
}

impl TrajectoryExporter for JsonLinesExporter {
    fn can_export_trajectory(&self) -> bool {
        true
    }

    fn can_export_points(&self) -> bool {
        false
    }

    fn append_entry(&mut self, entry: &TrajectoryEntry) -> Result<(), Error> {
        let isometry = entry.pose.isometry();
        let rotation = isometry.rotation.matrix();
        let center = entry.pose.inverse().isometry().translation.vector;
        let line = JsonEntry {
            label: &entry.label,
            frame: entry.frame_index,
            identifier: &entry.identifier,
            valid: entry.valid,
            rotation: [0, 1, 2].map(|row| [0, 1, 2].map(|column| rotation[(row, column)])),
            translation: isometry.translation.vector.into(),
            center: center.into(),
            intrinsics: entry.intrinsics.as_ref(),
        };
        let result = serde_json::to_writer(&mut self.writer, &line)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(self.writer))
            .and_then(|()| self.writer.flush());
        result.map_err(self.export_error())
    }

    fn append_points(&mut self, _: &[ScenePoint]) -> Result<(), Error> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let result = self.writer.flush();
        result.map_err(self.export_error())
    }
}

/// A camera drawn as a pyramid from its optical center.
struct ExportCamera {
    optical_center: Point3<f64>,
    up_direction: Vector3<f64>,
    forward_direction: Vector3<f64>,
    color: [u8; 3],
}

/// Writes camera frusta and scene points to an ASCII PLY file.
///
/// The file is rewritten after every appended entry, so it always holds the cameras exported so
/// far, even if the run is interrupted.
#[derive(Debug)]
pub struct PlyExporter {
    path: PathBuf,
    cameras: Vec<(WorldToCamera, bool)>,
    points: Vec<ScenePoint>,
    frustum_size: f64,
}

impl PlyExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cameras: vec![],
            points: vec![],
            frustum_size: 0.1,
        }
    }

    /// The distance, in world units, from a camera center to its image plane in the output.
    #[must_use]
    pub fn frustum_size(self, frustum_size: f64) -> Self {
        Self {
            frustum_size,
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite(&self) -> Result<(), Error> {
        let cameras = self
            .cameras
            .iter()
            .map(|&(pose, valid)| {
                let camera = pose.inverse().isometry();
                ExportCamera {
                    optical_center: camera.translation.vector.into(),
                    up_direction: camera.rotation * -Vector3::y(),
                    forward_direction: camera.rotation * Vector3::z(),
                    color: if valid { CAMERA_COLOR } else { PLACEHOLDER_COLOR },
                }
            })
            .collect();
        let export_error = |source| Error::Export {
            path: self.path.clone(),
            source,
        };
        let file = File::create(&self.path).map_err(export_error)?;
        write_ply(BufWriter::new(file), &self.points, cameras, self.frustum_size)
            .map_err(export_error)
    }
}

impl TrajectoryExporter for PlyExporter {
    fn can_export_trajectory(&self) -> bool {
        true
    }

    fn can_export_points(&self) -> bool {
        true
    }

    fn append_entry(&mut self, entry: &TrajectoryEntry) -> Result<(), Error> {
        self.cameras.push((entry.pose, entry.valid));
        self.rewrite()
    }

    fn append_points(&mut self, points: &[ScenePoint]) -> Result<(), Error> {
        self.points.extend_from_slice(points);
        self.rewrite()
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.rewrite()?;
        info!(
            "exported {} cameras and {} points to {}",
            self.cameras.len(),
            self.points.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn write_ply(
    mut writer: impl Write,
    points: &[ScenePoint],
    cameras: Vec<ExportCamera>,
    frustum_size: f64,
) -> std::io::Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from rust-cv/localize-sequence".to_string());

    let mut point_element = ElementDef::new("vertex".to_string());
    for axis in ["x", "y", "z"] {
        point_element.properties.add(PropertyDef::new(
            axis.to_string(),
            PropertyType::Scalar(ScalarType::Double),
        ));
    }
    for channel in ["red", "green", "blue"] {
        point_element.properties.add(PropertyDef::new(
            channel.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(point_element);

    let mut face_element = ElementDef::new("face".to_string());
    face_element.properties.add(PropertyDef::new(
        "vertex_index".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    ));
    ply.header.elements.add(face_element);

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };

    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    for ExportCamera {
        optical_center,
        up_direction,
        forward_direction,
        color,
    } in cameras
    {
        let right_direction = forward_direction.cross(&up_direction);
        let center_point = add_vertex(optical_center, color);
        let [up_right, up_left, down_left, down_right] =
            [(1, 1), (1, -1), (-1, -1), (-1, 1)].map(|(up, right)| {
                add_vertex(
                    optical_center
                        + forward_direction * frustum_size
                        + up as f64 * up_direction * frustum_size
                        + right as f64 * right_direction * frustum_size,
                    color,
                )
            });
        add_triangle(center_point, down_right, up_right);
        add_triangle(center_point, up_right, up_left);
        add_triangle(center_point, up_left, down_left);
        add_triangle(center_point, down_left, down_right);
    }

    for point in points {
        add_vertex(point.position, point.color);
    }

    ply.payload.insert("vertex".to_string(), vertices);
    ply.payload.insert("face".to_string(), faces);

    Writer::new().write_ply(&mut writer, &mut ply)?;
    writer.flush()
}

/// Accepts everything and persists nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExporter;

impl TrajectoryExporter for NoopExporter {
    fn can_export_trajectory(&self) -> bool {
        false
    }

    fn can_export_points(&self) -> bool {
        false
    }

    fn append_entry(&mut self, _: &TrajectoryEntry) -> Result<(), Error> {
        Ok(())
    }

    fn append_points(&mut self, _: &[ScenePoint]) -> Result<(), Error> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
