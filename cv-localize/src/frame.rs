use crate::{Error, Intrinsics};
use image::DynamicImage;
use log::*;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "pgm", "ppm"];

/// One image of the sequence being localized.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position of the frame in its sequence, starting at `0`.
    pub index: usize,
    pub image: DynamicImage,
    /// Calibration provided with the media, if any.
    pub calibration: Option<Intrinsics>,
    /// A human readable identifier, typically the image path.
    pub identifier: String,
}

impl Frame {
    pub fn has_calibration(&self) -> bool {
        self.calibration.is_some()
    }
}

/// Produces the frames of a sequence in order.
///
/// Implementations must yield frames with consecutive indices starting at `0`.
/// Construction of a source is its initialization and must fail if the media can not be used.
pub trait FrameSource {
    /// Retrieves the next frame, or `None` once the sequence is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, Error>;
}

impl<S> FrameSource for Box<S>
where
    S: FrameSource + ?Sized,
{
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        (**self).next_frame()
    }
}

/// A sequence of image files on disk.
#[derive(Debug, Clone)]
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    calibration: Option<Intrinsics>,
    next: usize,
}

impl ImageSequence {
    /// Opens a media path.
    ///
    /// The media can be a directory (its images are used in lexicographic order),
    /// a `.txt` list with one image path per line (relative paths are resolved against the list's
    /// directory), or a single image. If `calibration` is given, it is loaded with
    /// [`Intrinsics::open`] and applies to every frame.
    pub fn open(media: impl AsRef<Path>, calibration: Option<&Path>) -> Result<Self, Error> {
        let media = media.as_ref();
        let media_io = |source| Error::MediaIo {
            path: media.to_owned(),
            source,
        };
        let paths = if media.is_dir() {
            let mut paths = std::fs::read_dir(media)
                .map_err(media_io)?
                .map(|entry| entry.map(|entry| entry.path()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(media_io)?;
            paths.retain(|path| is_image(path));
            paths.sort();
            paths
        } else if has_extension(media, &["txt"]) {
            let list = std::fs::read_to_string(media).map_err(media_io)?;
            let base = media.parent().unwrap_or_else(|| Path::new(""));
            list.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| base.join(line))
                .collect()
        } else if is_image(media) {
            if !media.is_file() {
                return Err(media_io(std::io::ErrorKind::NotFound.into()));
            }
            vec![media.to_owned()]
        } else {
            return Err(Error::UnsupportedMedia {
                path: media.to_owned(),
            });
        };

        if paths.is_empty() {
            return Err(Error::EmptyMedia {
                path: media.to_owned(),
            });
        }

        let calibration = calibration.map(Intrinsics::open).transpose()?;
        info!(
            "opened {} with {} frames ({})",
            media.display(),
            paths.len(),
            if calibration.is_some() {
                "calibrated"
            } else {
                "uncalibrated"
            }
        );
        Ok(Self {
            paths,
            calibration,
            next: 0,
        })
    }

    /// The number of frames in the sequence.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let index = self.next;
        let path = match self.paths.get(index) {
            Some(path) => path,
            None => return Ok(None),
        };
        self.next += 1;
        let image = image::open(path).map_err(|source| Error::Image {
            path: path.clone(),
            source,
        })?;
        Ok(Some(Frame {
            index,
            image,
            calibration: self.calibration,
            identifier: path.display().to_string(),
        }))
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| {
            extensions
                .iter()
                .any(|candidate| extension.eq_ignore_ascii_case(candidate))
        })
        .unwrap_or(false)
}

fn is_image(path: &Path) -> bool {
    has_extension(path, IMAGE_EXTENSIONS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn write_image(path: &Path) {
        GrayImage::from_pixel(8, 6, Luma([128u8])).save(path).unwrap();
    }

    #[test]
    fn directory_frames_come_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.png", "c.png"] {
            write_image(&dir.path().join(name));
        }
        std::fs::write(dir.path().join("notes.md"), "not an image").unwrap();

        let mut sequence = ImageSequence::open(dir.path(), None).unwrap();
        assert_eq!(sequence.len(), 3);
        let mut identifiers = vec![];
        while let Some(frame) = sequence.next_frame().unwrap() {
            assert_eq!(frame.index, identifiers.len());
            assert!(!frame.has_calibration());
            identifiers.push(frame.identifier);
        }
        assert!(identifiers[0].ends_with("a.png"));
        assert!(identifiers[2].ends_with("c.png"));
        assert!(sequence.next_frame().unwrap().is_none());
    }

    #[test]
    fn image_lists_resolve_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("0001.png"));
        let list = dir.path().join("frames.txt");
        std::fs::write(&list, "# sequence\n0001.png\n\n").unwrap();
        let calibration = dir.path().join("calibration.json");
        std::fs::write(
            &calibration,
            r#"{"focals": [10.0, 10.0], "principal_point": [4.0, 3.0]}"#,
        )
        .unwrap();

        let mut sequence = ImageSequence::open(&list, Some(&calibration)).unwrap();
        let frame = sequence.next_frame().unwrap().unwrap();
        assert!(frame.has_calibration());
        assert_eq!(frame.image.width(), 8);
    }

    #[test]
    fn empty_and_unsupported_media_fail_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageSequence::open(dir.path(), None),
            Err(Error::EmptyMedia { .. })
        ));
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, [0u8; 4]).unwrap();
        let error = ImageSequence::open(&video, None).unwrap_err();
        assert!(matches!(error, Error::UnsupportedMedia { .. }));
        assert_eq!(error.exit_code(), 2);
    }
}
