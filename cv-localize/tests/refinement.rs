use approx::assert_relative_eq;
use cv_core::nalgebra::{IsometryMatrix3, Point3, Rotation3, Translation3, Vector3};
use cv_core::WorldToCamera;
use cv_localize::{
    BundleRefiner, Correspondence, Diagnostics, Intrinsics, LocalizationOutcome,
    RefinementResult, RefinementSettings, RefinementStage, SequenceRefiner, TrajectoryAccumulator,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

fn intrinsics() -> Intrinsics {
    Intrinsics::new(800.0, [320.0, 240.0])
}

fn true_pose(index: usize) -> WorldToCamera {
    WorldToCamera(IsometryMatrix3::from_parts(
        Translation3::new(-0.3 * index as f64, 0.0, 0.0),
        Rotation3::from_euler_angles(0.0, 0.02 * index as f64, 0.0),
    ))
}

fn landmarks(rng: &mut Pcg64) -> Vec<Point3<f64>> {
    (0..40)
        .map(|_| {
            Point3::new(
                rng.gen_range(-2.0..3.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(4.0..8.0),
            )
        })
        .collect()
}

/// Localized outcomes whose inliers are exact projections of `landmarks` but whose poses are
/// perturbed.
fn outcomes(rng: &mut Pcg64, landmarks: &[Point3<f64>], frames: usize) -> Vec<LocalizationOutcome> {
    (0..frames)
        .map(|index| {
            let pose = true_pose(index);
            let inliers = landmarks
                .iter()
                .enumerate()
                .filter_map(|(landmark, &point)| {
                    intrinsics()
                        .project(pose.0 * point)
                        .map(|keypoint| Correspondence {
                            keypoint,
                            landmark,
                            point,
                        })
                })
                .collect();
            let noise = IsometryMatrix3::from_parts(
                Translation3::from(Vector3::new(
                    rng.gen_range(-0.05..0.05),
                    rng.gen_range(-0.05..0.05),
                    rng.gen_range(-0.05..0.05),
                )),
                Rotation3::from_scaled_axis(Vector3::new(
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.01..0.01),
                )),
            );
            LocalizationOutcome::localized(
                index,
                format!("{:04}.png", index),
                WorldToCamera(noise * pose.0),
                intrinsics(),
                Diagnostics {
                    candidates: vec![0],
                    matches: landmarks.len(),
                    inliers,
                },
            )
        })
        .collect()
}

fn pose_error(outcome: &LocalizationOutcome) -> f64 {
    let truth = true_pose(outcome.frame_index).0;
    let pose = outcome.export_pose().0;
    (pose.translation.vector - truth.translation.vector).norm()
        + (pose.rotation * truth.rotation.inverse()).angle()
}

#[test]
fn bundle_adjustment_recovers_perturbed_poses() {
    let _ = pretty_env_logger::try_init();
    let mut rng = Pcg64::seed_from_u64(0);
    let landmarks = landmarks(&mut rng);
    let mut outcomes = outcomes(&mut rng, &landmarks, 4);
    let before: f64 = outcomes.iter().map(pose_error).sum();

    let mut refiner = BundleRefiner::new(RefinementSettings::default());
    assert!(refiner.refine_sequence(&intrinsics(), &mut outcomes));

    let after: f64 = outcomes.iter().map(pose_error).sum();
    assert!(after < 0.1 * before, "error went from {} to {}", before, after);
    for (index, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.frame_index, index);
        assert!(outcome.is_valid());
        for inlier in &outcome.diagnostics.inliers {
            assert_relative_eq!(
                inlier.point,
                landmarks[inlier.landmark],
                epsilon = 1e-2
            );
        }
    }
}

#[test]
fn refinement_stage_adjusts_only_localized_frames() {
    let mut rng = Pcg64::seed_from_u64(1);
    let landmarks = landmarks(&mut rng);
    let mut accumulator = TrajectoryAccumulator::new();
    for (index, outcome) in outcomes(&mut rng, &landmarks, 5).into_iter().enumerate() {
        accumulator.append(if index == 2 {
            LocalizationOutcome::failed(index, outcome.identifier, intrinsics(), Diagnostics::default())
        } else {
            outcome
        });
    }
    let trajectory = accumulator.into_trajectory();

    let mut refiner = BundleRefiner::default();
    let refined = match RefinementStage::new(&mut refiner).refine(&trajectory, &intrinsics()) {
        RefinementResult::Refined(refined) => refined,
        other => panic!("refinement did not succeed: {:?}", other),
    };
    assert_eq!(refined.len(), 5);
    assert_eq!(refined.valid_count(), 4);
    assert!(!refined.get(2).unwrap().is_valid());
    let before: f64 = trajectory.valid_subsequence().map(pose_error).sum();
    let after: f64 = refined.valid_subsequence().map(pose_error).sum();
    assert!(after < before);
}
