use crate::{Descriptor, Error};
use cv_core::nalgebra::Point3;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// The extension of the files holding the descriptors of a view.
pub const DESCRIPTOR_EXTENSION: &str = "desc";

/// A colored point of the scene, used for exporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenePoint {
    pub position: Point3<f64>,
    pub color: [u8; 3],
}

/// An image of the reconstruction and the descriptors of all its features.
#[derive(Debug, Clone)]
pub struct View {
    pub id: u32,
    pub name: String,
    pub descriptors: Vec<Descriptor>,
}

/// A triangulated point of the reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Landmark {
    pub position: Point3<f64>,
    pub color: [u8; 3],
    /// `(view index, feature index)` of every feature observing this landmark.
    pub observations: Vec<(usize, usize)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SceneFile {
    views: Vec<ViewRecord>,
    landmarks: Vec<LandmarkRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ViewRecord {
    id: u32,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LandmarkRecord {
    position: [f64; 3],
    #[serde(default = "default_color")]
    color: [u8; 3],
    observations: Vec<ObservationRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObservationRecord {
    view: u32,
    feature: usize,
}

fn default_color() -> [u8; 3] {
    [255, 255, 255]
}

/// A prebuilt reconstruction that frames are localized against.
#[derive(Debug, Clone)]
pub struct Scene {
    views: Vec<View>,
    landmarks: Vec<Landmark>,
    /// `(feature index, landmark index)` for each view.
    view_landmarks: Vec<Vec<(usize, usize)>>,
}

impl Scene {
    /// Assembles a scene, checking that every observation refers to an existing feature.
    ///
    /// A feature observing several landmarks only keeps the first one.
    pub fn new(views: Vec<View>, landmarks: Vec<Landmark>) -> Result<Self, String> {
        if views.is_empty() {
            return Err("the scene has no views".to_owned());
        }
        let mut view_landmarks = vec![vec![]; views.len()];
        let mut taken: Vec<HashSet<usize>> = vec![HashSet::new(); views.len()];
        for (landmark_index, landmark) in landmarks.iter().enumerate() {
            if !landmark.position.coords.iter().all(|n| n.is_finite()) {
                return Err(format!("landmark {} has a non-finite position", landmark_index));
            }
            for &(view, feature) in &landmark.observations {
                let descriptors = views
                    .get(view)
                    .map(|view| view.descriptors.len())
                    .ok_or_else(|| format!("landmark {} observed by missing view {}", landmark_index, view))?;
                if feature >= descriptors {
                    return Err(format!(
                        "landmark {} observed by feature {} of view {}, which has {} features",
                        landmark_index, feature, views[view].id, descriptors
                    ));
                }
                if !taken[view].insert(feature) {
                    debug!(
                        "feature {} of view {} observes more than one landmark",
                        feature, views[view].id
                    );
                    continue;
                }
                view_landmarks[view].push((feature, landmark_index));
            }
        }
        Ok(Self {
            views,
            landmarks,
            view_landmarks,
        })
    }

    /// Loads a scene file and the descriptors of its views.
    ///
    /// The descriptors of the view with id `N` are read from `N.desc` in `descriptors`,
    /// which defaults to the `matches` directory next to the scene file.
    pub fn open(path: impl AsRef<Path>, descriptors: Option<&Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let map_io = |path: &Path| {
            let path = path.to_owned();
            move |source| Error::MapIo { path, source }
        };
        let format = |reason: String| Error::MapFormat {
            path: path.to_owned(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(map_io(path))?;
        let file: SceneFile = serde_json::from_str(&text).map_err(|source| Error::MapJson {
            path: path.to_owned(),
            source,
        })?;
        let descriptor_dir = descriptors.map(Path::to_owned).unwrap_or_else(|| {
            path.parent()
                .unwrap_or_else(|| Path::new(""))
                .join("matches")
        });

        let mut view_indices = HashMap::new();
        let mut views = Vec::with_capacity(file.views.len());
        for ViewRecord { id, name } in file.views {
            if view_indices.insert(id, views.len()).is_some() {
                return Err(format(format!("view id {} appears twice", id)));
            }
            let descriptor_path: PathBuf =
                descriptor_dir.join(format!("{}.{}", id, DESCRIPTOR_EXTENSION));
            let descriptors = read_descriptors(&descriptor_path).map_err(|error| match error {
                Error::MapIo { .. } => error,
                error => Error::MapDescriptors {
                    path: descriptor_path.clone(),
                    source: Box::new(error),
                },
            })?;
            views.push(View {
                id,
                name,
                descriptors,
            });
        }

        let landmarks = file
            .landmarks
            .into_iter()
            .map(|landmark| {
                let observations = landmark
                    .observations
                    .into_iter()
                    .map(|ObservationRecord { view, feature }| {
                        view_indices
                            .get(&view)
                            .map(|&view| (view, feature))
                            .ok_or_else(|| format!("observation of unknown view {}", view))
                    })
                    .collect::<Result<Vec<_>, String>>()?;
                Ok(Landmark {
                    position: Point3::from(landmark.position),
                    color: landmark.color,
                    observations,
                })
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(format)?;

        let scene = Self::new(views, landmarks).map_err(format)?;
        info!(
            "loaded scene {} with {} views and {} landmarks",
            path.display(),
            scene.views.len(),
            scene.landmarks.len()
        );
        Ok(scene)
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn view(&self, view: usize) -> &View {
        &self.views[view]
    }

    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    pub fn landmark(&self, landmark: usize) -> &Landmark {
        &self.landmarks[landmark]
    }

    /// The features of a view that observe a landmark, as `(feature index, landmark index)`.
    pub fn view_landmarks(&self, view: usize) -> &[(usize, usize)] {
        &self.view_landmarks[view]
    }

    pub fn points(&self) -> Vec<ScenePoint> {
        self.landmarks
            .iter()
            .map(|landmark| ScenePoint {
                position: landmark.position,
                color: landmark.color,
            })
            .collect()
    }
}

/// Reads a descriptor file with one hexadecimal descriptor per line.
pub fn read_descriptors(path: &Path) -> Result<Vec<Descriptor>, Error> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::MapIo {
        path: path.to_owned(),
        source,
    })?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}

/// Writes descriptors in the format read by [`read_descriptors`].
pub fn write_descriptors(path: &Path, descriptors: &[Descriptor]) -> Result<(), Error> {
    let text: String = descriptors
        .iter()
        .map(|descriptor| format!("{}\n", descriptor))
        .collect();
    std::fs::write(path, text).map_err(|source| Error::MapIo {
        path: path.to_owned(),
        source,
    })
}
