use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a localization run.
///
/// Per-frame localization failures and refinement failures are not errors.
/// They are recorded in the trajectory and the [`RunSummary`](crate::RunSummary).
#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to read media {path:?}: {source}")]
    MediaIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("media {path:?} is not a directory, an image list or an image")]
    UnsupportedMedia { path: PathBuf },
    #[error("media {path:?} contains no frames")]
    EmptyMedia { path: PathBuf },
    #[error("unable to read calibration {path:?}: {source}")]
    CalibrationIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse calibration {path:?}: {source}")]
    CalibrationJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid calibration {path:?}: {reason}")]
    Calibration { path: PathBuf, reason: String },
    #[error("unable to read map file {path:?}: {source}")]
    MapIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse map file {path:?}: {source}")]
    MapJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid view descriptors {path:?}: {source}")]
    MapDescriptors {
        path: PathBuf,
        source: Box<Error>,
    },
    #[error("invalid map file {path:?}: {reason}")]
    MapFormat { path: PathBuf, reason: String },
    #[error("invalid vocabulary {path:?}: {reason}")]
    Vocabulary { path: PathBuf, reason: String },
    #[error("sequence refinement cannot run when intrinsics are refined per frame")]
    ConflictingRefinement,
    #[error("unable to export to {path:?}: {source}")]
    Export {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to read settings {path:?}: {source}")]
    SettingsIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse settings {path:?}: {source}")]
    SettingsJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid {what}: {value:?}")]
    InvalidValue { what: &'static str, value: String },
}

impl Error {
    /// The process exit code that reports this error.
    ///
    /// `0` is reserved for completed runs, even those where frames failed to localize.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::SettingsIo { .. } | Error::SettingsJson { .. } | Error::InvalidValue { .. } => 1,
            Error::MediaIo { .. }
            | Error::Image { .. }
            | Error::UnsupportedMedia { .. }
            | Error::EmptyMedia { .. }
            | Error::CalibrationIo { .. }
            | Error::CalibrationJson { .. }
            | Error::Calibration { .. } => 2,
            Error::MapIo { .. }
            | Error::MapJson { .. }
            | Error::MapDescriptors { .. }
            | Error::MapFormat { .. }
            | Error::Vocabulary { .. } => 3,
            Error::ConflictingRefinement => 4,
            Error::Export { .. } => 5,
        }
    }

    /// Returns `true` if the error happened while bringing up the frame source or the localizer.
    pub fn is_initialization(&self) -> bool {
        matches!(self.exit_code(), 2 | 3)
    }
}
