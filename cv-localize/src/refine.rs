use crate::{
    reprojection::{cost, BundleLandmark, BundleObservation, BundleProblem},
    Correspondence, Intrinsics, LocalizationOutcome, RefinementSettings, Trajectory, TrajectoryAccumulator,
};
use cv_core::nalgebra::Point3;
use cv_core::WorldToCamera;
use itertools::Itertools;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::*;
use std::collections::HashMap;

/// Jointly refines the poses of a sequence of localized frames.
pub trait SequenceRefiner {
    /// Refines the poses of `outcomes` in place, all of which are valid and share `intrinsics`.
    ///
    /// Returns `false` if the refinement failed, in which case `outcomes` must be ignored.
    /// The outcomes must stay in the same order.
    fn refine_sequence(&mut self, intrinsics: &Intrinsics, outcomes: &mut [LocalizationOutcome]) -> bool;
}

impl<R> SequenceRefiner for Box<R>
where
    R: SequenceRefiner + ?Sized,
{
    fn refine_sequence(&mut self, intrinsics: &Intrinsics, outcomes: &mut [LocalizationOutcome]) -> bool {
        (**self).refine_sequence(intrinsics, outcomes)
    }
}

/// Bundle adjustment of the poses and the landmarks seen by their inliers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleRefiner {
    settings: RefinementSettings,
}

impl BundleRefiner {
    pub fn new(settings: RefinementSettings) -> Self {
        Self { settings }
    }
}

impl SequenceRefiner for BundleRefiner {
    fn refine_sequence(&mut self, intrinsics: &Intrinsics, outcomes: &mut [LocalizationOutcome]) -> bool {
        let poses = match outcomes
            .iter()
            .map(|outcome| outcome.pose)
            .collect::<Option<Vec<WorldToCamera>>>()
        {
            Some(poses) => poses,
            None => {
                error!("bundle adjustment given a frame without a pose");
                return false;
            }
        };

        // Landmarks seen from enough frames are refined, starting with the most observed.
        let limit = self.settings.max_observations_per_frame;
        let counts = outcomes
            .iter()
            .flat_map(|outcome| used_inliers(outcome, limit).map(|inlier| inlier.landmark).unique())
            .counts();
        let free: Vec<usize> = counts
            .iter()
            .filter(|&(_, &count)| count >= self.settings.min_landmark_observations)
            .sorted_by_key(|&(&landmark, &count)| (core::cmp::Reverse(count), landmark))
            .map(|(&landmark, _)| landmark)
            .take(self.settings.max_landmarks)
            .collect();
        let free_indices: HashMap<usize, usize> = free
            .iter()
            .enumerate()
            .map(|(index, &landmark)| (landmark, index))
            .collect();

        let mut positions = vec![Point3::origin(); free.len()];
        let mut observations = vec![];
        for (pose, outcome) in outcomes.iter().enumerate() {
            for inlier in used_inliers(outcome, limit) {
                let landmark = match free_indices.get(&inlier.landmark) {
                    Some(&index) => {
                        positions[index] = inlier.point;
                        BundleLandmark::Free(index)
                    }
                    None => BundleLandmark::Fixed(inlier.point),
                };
                observations.push(BundleObservation {
                    pose,
                    landmark,
                    pixel: inlier.keypoint,
                });
            }
        }
        if observations.is_empty() {
            warn!("no observations to adjust the sequence with");
            return false;
        }

        info!(
            "adjusting {} poses and {} landmarks with {} observations",
            poses.len(),
            free.len(),
            observations.len()
        );
        let problem = BundleProblem::new(
            *intrinsics,
            &poses,
            positions,
            observations,
            self.settings.structure_prior_weight,
        );
        let initial = match problem.residuals() {
            Some(residuals) => cost(&residuals),
            None => return false,
        };
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.settings.patience)
            .minimize(problem);
        info!(
            "bundle adjustment finished after {} evaluations with {:?}, cost {:.3} to {:.3}",
            report.number_of_evaluations, report.termination, initial, report.objective_function
        );
        if !report.termination.was_successful() || !(report.objective_function <= initial) {
            return false;
        }

        for (index, outcome) in outcomes.iter_mut().enumerate() {
            outcome.pose = Some(problem.pose(index));
            outcome.intrinsics = Some(*intrinsics);
            for inlier in outcome.diagnostics.inliers.iter_mut() {
                if let Some(&landmark) = free_indices.get(&inlier.landmark) {
                    inlier.point = problem.landmark(landmark);
                }
            }
        }
        true
    }
}

fn used_inliers(outcome: &LocalizationOutcome, limit: usize) -> impl Iterator<Item = &Correspondence> + '_ {
    outcome.diagnostics.inliers.iter().take(limit)
}

/// What came out of refining a trajectory.
#[derive(Debug, Clone, PartialEq)]
pub enum RefinementResult {
    /// The trajectory had no valid frame, the refiner was not invoked.
    Skipped,
    Failed,
    /// The refined trajectory, aligned with the original one.
    Refined(Trajectory),
}

/// Runs a [`SequenceRefiner`] on the valid part of a trajectory.
#[derive(Debug)]
pub struct RefinementStage<'a, R> {
    refiner: &'a mut R,
}

impl<'a, R> RefinementStage<'a, R>
where
    R: SequenceRefiner,
{
    pub fn new(refiner: &'a mut R) -> Self {
        Self { refiner }
    }

    /// Refines the valid outcomes of `trajectory` with shared `intrinsics`.
    ///
    /// The refined trajectory has the same length as the original. Frames that were not
    /// localized keep an invalid placeholder with the shared intrinsics at their position.
    pub fn refine(&mut self, trajectory: &Trajectory, intrinsics: &Intrinsics) -> RefinementResult {
        let mut valid: Vec<LocalizationOutcome> = trajectory.valid_subsequence().cloned().collect();
        if valid.is_empty() {
            return RefinementResult::Skipped;
        }
        if !self.refiner.refine_sequence(intrinsics, &mut valid) {
            return RefinementResult::Failed;
        }

        let mut refined = valid.into_iter();
        let mut accumulator = TrajectoryAccumulator::new();
        for original in trajectory {
            let outcome = if original.is_valid() {
                match refined.next() {
                    Some(outcome) if outcome.frame_index == original.frame_index => outcome,
                    _ => {
                        error!("refined outcomes no longer match frame {}", original.frame_index);
                        return RefinementResult::Failed;
                    }
                }
            } else {
                LocalizationOutcome::placeholder(original.frame_index, original.identifier.clone())
                    .with_intrinsics(*intrinsics)
            };
            accumulator.append(outcome);
        }
        RefinementResult::Refined(accumulator.into_trajectory())
    }
}
