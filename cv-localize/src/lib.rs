//! # `cv-localize`
//!
//! Localizes every frame of an image sequence against a prebuilt reconstruction.
//!
//! Each frame is described with AKAZE features, the most similar views of the reconstruction
//! are retrieved with a vocabulary tree, and the pose is resected from the 2D-3D matches with
//! ARRSAC and Lambda Twist. Once the sequence is exhausted, the poses of the localized frames
//! can be jointly refined with a bundle adjustment. The raw and the refined trajectories are
//! exported separately and keep one entry per frame, localized or not.
//!
//! The [`PipelineDriver`] only depends on the [`FrameSource`], [`Localizer`],
//! [`SequenceRefiner`] and [`ExportTarget`] traits. This crate provides
//! [`ImageSequence`], [`MapLocalizer`], [`BundleRefiner`] and [`FileExportTarget`] as their
//! implementations.

mod descriptor;
mod error;
mod export;
mod frame;
mod intrinsics;
mod localizer;
mod pipeline;
mod refine;
pub mod reprojection;
mod scene;
mod settings;
mod timing;
mod trajectory;
mod vocabulary;

pub use descriptor::*;
pub use error::*;
pub use export::*;
pub use frame::*;
pub use intrinsics::*;
pub use localizer::*;
pub use pipeline::*;
pub use refine::*;
pub use scene::*;
pub use settings::*;
pub use timing::*;
pub use trajectory::*;
pub use vocabulary::*;
