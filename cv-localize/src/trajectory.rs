use crate::Intrinsics;
use cv_core::nalgebra::{IsometryMatrix3, Point2, Point3};
use cv_core::WorldToCamera;

/// A keypoint of a frame matched to a landmark of the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// The keypoint position in pixels.
    pub keypoint: Point2<f64>,
    /// The index of the landmark in the scene.
    pub landmark: usize,
    /// The landmark position in the world.
    pub point: Point3<f64>,
}

/// What the localizer saw while localizing a frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    /// The scene views retrieved as candidates, most similar first.
    pub candidates: Vec<usize>,
    /// The number of 2D-3D matches found.
    pub matches: usize,
    /// The correspondences consistent with the estimated pose.
    pub inliers: Vec<Correspondence>,
}

/// The result of localizing one frame.
///
/// An outcome is valid exactly when it carries a pose.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalizationOutcome {
    pub frame_index: usize,
    pub identifier: String,
    pub pose: Option<WorldToCamera>,
    /// The intrinsics the pose was estimated with.
    pub intrinsics: Option<Intrinsics>,
    pub diagnostics: Diagnostics,
}

impl LocalizationOutcome {
    pub fn localized(
        frame_index: usize,
        identifier: impl Into<String>,
        pose: WorldToCamera,
        intrinsics: Intrinsics,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            frame_index,
            identifier: identifier.into(),
            pose: Some(pose),
            intrinsics: Some(intrinsics),
            diagnostics,
        }
    }

    /// A frame that could not be localized with `intrinsics`.
    pub fn failed(
        frame_index: usize,
        identifier: impl Into<String>,
        intrinsics: Intrinsics,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            intrinsics: Some(intrinsics),
            diagnostics,
            ..Self::placeholder(frame_index, identifier)
        }
    }

    /// An invalid outcome that only keeps the identity of a frame.
    pub fn placeholder(frame_index: usize, identifier: impl Into<String>) -> Self {
        Self {
            frame_index,
            identifier: identifier.into(),
            pose: None,
            intrinsics: None,
            diagnostics: Diagnostics::default(),
        }
    }

    #[must_use]
    pub fn with_intrinsics(self, intrinsics: Intrinsics) -> Self {
        Self {
            intrinsics: Some(intrinsics),
            ..self
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pose.is_some()
    }

    /// The pose written to exports, the identity for invalid outcomes.
    pub fn export_pose(&self) -> WorldToCamera {
        self.pose
            .unwrap_or_else(|| WorldToCamera(IsometryMatrix3::identity()))
    }

    /// The export label, `camera.0007` when valid and `camera.V.0007` when not.
    pub fn label(&self) -> String {
        if self.is_valid() {
            format!("camera.{:04}", self.frame_index)
        } else {
            format!("camera.V.{:04}", self.frame_index)
        }
    }
}

/// Per-frame outcomes of a sequence, where the outcome at position `i` belongs to frame `i`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    outcomes: Vec<LocalizationOutcome>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, frame_index: usize) -> Option<&LocalizationOutcome> {
        self.outcomes.get(frame_index)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, LocalizationOutcome> {
        self.outcomes.iter()
    }

    pub fn valid_count(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.is_valid()).count()
    }

    pub fn invalid_count(&self) -> usize {
        self.len() - self.valid_count()
    }

    /// The valid outcomes in frame order.
    pub fn valid_subsequence(&self) -> impl Iterator<Item = &LocalizationOutcome> + '_ {
        self.outcomes.iter().filter(|outcome| outcome.is_valid())
    }

    /// The intrinsics of the last valid outcome.
    pub fn last_valid_intrinsics(&self) -> Option<Intrinsics> {
        self.outcomes
            .iter()
            .rev()
            .filter(|outcome| outcome.is_valid())
            .find_map(|outcome| outcome.intrinsics)
    }

    pub fn into_outcomes(self) -> Vec<LocalizationOutcome> {
        self.outcomes
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a LocalizationOutcome;
    type IntoIter = core::slice::Iter<'a, LocalizationOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.iter()
    }
}

/// Collects the outcomes of a sequence as its frames are localized.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryAccumulator {
    trajectory: Trajectory,
    valid: usize,
}

impl TrajectoryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the outcome of the next frame.
    ///
    /// # Panics
    ///
    /// Panics if the outcome does not belong to the frame after the last appended one.
    pub fn append(&mut self, outcome: LocalizationOutcome) {
        assert_eq!(
            outcome.frame_index,
            self.len(),
            "outcome of frame {} appended out of order",
            outcome.frame_index
        );
        if outcome.is_valid() {
            self.valid += 1;
        }
        self.trajectory.outcomes.push(outcome);
    }

    pub fn len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectory.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.valid
    }

    pub fn invalid_count(&self) -> usize {
        self.len() - self.valid
    }

    pub fn valid_subsequence(&self) -> impl Iterator<Item = &LocalizationOutcome> + '_ {
        self.trajectory.valid_subsequence()
    }

    pub fn to_trajectory(&self) -> Trajectory {
        self.trajectory.clone()
    }

    pub fn into_trajectory(self) -> Trajectory {
        self.trajectory
    }
}
