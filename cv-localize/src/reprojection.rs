//! Reprojection error problems solved with Levenberg-Marquardt.
//!
//! Poses are parameterized by the scaled axis of their rotation followed by their translation.
//! Jacobians are computed by central differences, one observation at a time, so only the
//! parameters an observation depends on are perturbed.

use crate::{Correspondence, Intrinsics};
use cv_core::nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, IsometryMatrix3, Point2, Point3, Rotation3, Translation3, VecStorage,
    Vector2, Vector3,
};
use cv_core::WorldToCamera;
use levenberg_marquardt::LeastSquaresProblem;

/// The residual in pixels of a point that ends up behind the camera.
pub const BEHIND_CAMERA_RESIDUAL: f64 = 1000.0;

/// The step used for central differences.
const DIFFERENCE_STEP: f64 = 1e-6;

pub fn pose_to_params(pose: &WorldToCamera) -> [f64; 6] {
    let rotation = pose.0.rotation.scaled_axis();
    let translation = pose.0.translation.vector;
    [
        rotation.x,
        rotation.y,
        rotation.z,
        translation.x,
        translation.y,
        translation.z,
    ]
}

/// Builds a pose from the first six parameters of `params`.
pub fn pose_from_params(params: &[f64]) -> WorldToCamera {
    WorldToCamera(IsometryMatrix3::from_parts(
        Translation3::new(params[3], params[4], params[5]),
        Rotation3::from_scaled_axis(Vector3::new(params[0], params[1], params[2])),
    ))
}

/// The projection of a world point minus the pixel it was observed at.
pub fn reprojection_error(
    intrinsics: &Intrinsics,
    pose: &WorldToCamera,
    point: &Point3<f64>,
    observed: &Point2<f64>,
) -> Vector2<f64> {
    match intrinsics.project(pose.0 * point) {
        Some(projected) => projected - observed,
        None => Vector2::repeat(BEHIND_CAMERA_RESIDUAL),
    }
}

/// Half the squared norm of the residuals, the cost minimized by the solver.
pub fn cost(residuals: &DVector<f64>) -> f64 {
    0.5 * residuals.norm_squared()
}

/// Refines the pose and focal length of a single frame from its inlier correspondences.
///
/// The parameters are the six pose parameters and a scale applied to both focal lengths.
#[derive(Debug, Clone)]
pub struct FrameProblem {
    intrinsics: Intrinsics,
    correspondences: Vec<Correspondence>,
    params: DVector<f64>,
}

impl FrameProblem {
    pub fn new(pose: &WorldToCamera, intrinsics: Intrinsics, correspondences: Vec<Correspondence>) -> Self {
        let mut params = DVector::zeros(7);
        params.as_mut_slice()[..6].copy_from_slice(&pose_to_params(pose));
        params[6] = 1.0;
        Self {
            intrinsics,
            correspondences,
            params,
        }
    }

    pub fn pose(&self) -> WorldToCamera {
        pose_from_params(self.params.as_slice())
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics.scale_focals(self.params[6])
    }

    fn residuals_at(&self, params: &[f64]) -> DVector<f64> {
        let pose = pose_from_params(params);
        let intrinsics = self.intrinsics.scale_focals(params[6]);
        let mut residuals = DVector::zeros(self.correspondences.len() * 2);
        for (index, correspondence) in self.correspondences.iter().enumerate() {
            let error = reprojection_error(
                &intrinsics,
                &pose,
                &correspondence.point,
                &correspondence.keypoint,
            );
            residuals[index * 2] = error.x;
            residuals[index * 2 + 1] = error.y;
        }
        residuals
    }
}

impl LeastSquaresProblem<f64, Dynamic, Dynamic> for FrameProblem {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(self.params.as_slice()))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(self.correspondences.len() * 2, self.params.len());
        let mut params = self.params.clone_owned();
        for column in 0..params.len() {
            let original = params[column];
            params[column] = original + DIFFERENCE_STEP;
            let forward = self.residuals_at(params.as_slice());
            params[column] = original - DIFFERENCE_STEP;
            let backward = self.residuals_at(params.as_slice());
            params[column] = original;
            jacobian.set_column(column, &((forward - backward) / (2.0 * DIFFERENCE_STEP)));
        }
        Some(jacobian)
    }
}

/// The landmark seen by an observation of a [`BundleProblem`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BundleLandmark {
    /// A landmark whose position is refined, by index among the free landmarks.
    Free(usize),
    /// A landmark held at its map position.
    Fixed(Point3<f64>),
}

/// A landmark seen in a pixel of a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BundleObservation {
    /// The index of the observing pose.
    pub pose: usize,
    pub landmark: BundleLandmark,
    pub pixel: Point2<f64>,
}

/// Jointly refines camera poses and landmark positions with shared intrinsics.
///
/// Free landmarks are tied to their initial positions by a prior weighted in pixels per map
/// unit, which also fixes the gauge of the reconstruction.
///
/// The parameters are six per pose followed by three per free landmark.
/// The residuals are two per observation followed by three per free landmark.
#[derive(Debug, Clone)]
pub struct BundleProblem {
    intrinsics: Intrinsics,
    observations: Vec<BundleObservation>,
    priors: Vec<Point3<f64>>,
    prior_weight: f64,
    poses: usize,
    params: DVector<f64>,
}

impl BundleProblem {
    pub fn new(
        intrinsics: Intrinsics,
        poses: &[WorldToCamera],
        landmarks: Vec<Point3<f64>>,
        observations: Vec<BundleObservation>,
        prior_weight: f64,
    ) -> Self {
        let mut params = DVector::zeros(poses.len() * 6 + landmarks.len() * 3);
        for (index, pose) in poses.iter().enumerate() {
            params.as_mut_slice()[index * 6..index * 6 + 6].copy_from_slice(&pose_to_params(pose));
        }
        let base = poses.len() * 6;
        for (index, landmark) in landmarks.iter().enumerate() {
            params.as_mut_slice()[base + index * 3..base + index * 3 + 3]
                .copy_from_slice(landmark.coords.as_slice());
        }
        Self {
            intrinsics,
            observations,
            priors: landmarks,
            prior_weight,
            poses: poses.len(),
            params,
        }
    }

    pub fn pose(&self, index: usize) -> WorldToCamera {
        pose_from_params(&self.params.as_slice()[index * 6..])
    }

    pub fn landmark(&self, index: usize) -> Point3<f64> {
        let base = self.poses * 6 + index * 3;
        Point3::new(self.params[base], self.params[base + 1], self.params[base + 2])
    }

    fn landmark_base(&self, index: usize) -> usize {
        self.poses * 6 + index * 3
    }

    fn observation_error(&self, observation: &BundleObservation, params: &[f64]) -> Vector2<f64> {
        let pose = pose_from_params(&params[observation.pose * 6..]);
        let point = match observation.landmark {
            BundleLandmark::Free(index) => {
                let base = self.landmark_base(index);
                Point3::new(params[base], params[base + 1], params[base + 2])
            }
            BundleLandmark::Fixed(point) => point,
        };
        reprojection_error(&self.intrinsics, &pose, &point, &observation.pixel)
    }

    /// Central differences of one observation error along one parameter.
    fn observation_derivative(
        &self,
        observation: &BundleObservation,
        params: &mut [f64],
        column: usize,
    ) -> Vector2<f64> {
        let original = params[column];
        params[column] = original + DIFFERENCE_STEP;
        let forward = self.observation_error(observation, params);
        params[column] = original - DIFFERENCE_STEP;
        let backward = self.observation_error(observation, params);
        params[column] = original;
        (forward - backward) / (2.0 * DIFFERENCE_STEP)
    }
}

impl LeastSquaresProblem<f64, Dynamic, Dynamic> for BundleProblem {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(self.observations.len() * 2 + self.priors.len() * 3);
        for (index, observation) in self.observations.iter().enumerate() {
            let error = self.observation_error(observation, self.params.as_slice());
            residuals[index * 2] = error.x;
            residuals[index * 2 + 1] = error.y;
        }
        let base = self.observations.len() * 2;
        for (index, prior) in self.priors.iter().enumerate() {
            let offset = (self.landmark(index) - prior) * self.prior_weight;
            for axis in 0..3 {
                residuals[base + index * 3 + axis] = offset[axis];
            }
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(
            self.observations.len() * 2 + self.priors.len() * 3,
            self.params.len(),
        );
        let mut params = self.params.as_slice().to_vec();
        for (row, observation) in self.observations.iter().enumerate() {
            let pose_columns = observation.pose * 6..observation.pose * 6 + 6;
            let landmark_columns = match observation.landmark {
                BundleLandmark::Free(index) => {
                    let base = self.landmark_base(index);
                    base..base + 3
                }
                BundleLandmark::Fixed(_) => 0..0,
            };
            for column in pose_columns.chain(landmark_columns) {
                let derivative = self.observation_derivative(observation, &mut params, column);
                jacobian[(row * 2, column)] = derivative.x;
                jacobian[(row * 2 + 1, column)] = derivative.y;
            }
        }
        let base = self.observations.len() * 2;
        for index in 0..self.priors.len() {
            let column = self.landmark_base(index);
            for axis in 0..3 {
                jacobian[(base + index * 3 + axis, column + axis)] = self.prior_weight;
            }
        }
        Some(jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use levenberg_marquardt::{differentiate_numerically, LevenbergMarquardt};

    fn intrinsics() -> Intrinsics {
        Intrinsics::new(800.0, [320.0, 240.0])
    }

    fn pose() -> WorldToCamera {
        WorldToCamera(IsometryMatrix3::from_parts(
            Translation3::new(0.1, -0.2, 0.3),
            Rotation3::from_euler_angles(0.1, -0.05, 0.2),
        ))
    }

    fn grid() -> Vec<Point3<f64>> {
        let mut points = vec![];
        for x in -2..=2 {
            for y in -2..=2 {
                points.push(Point3::new(
                    x as f64 * 0.5,
                    y as f64 * 0.4,
                    5.0 + 0.3 * ((x * y) as f64),
                ));
            }
        }
        points
    }

    fn correspondences(pose: &WorldToCamera, intrinsics: &Intrinsics) -> Vec<Correspondence> {
        grid()
            .into_iter()
            .enumerate()
            .map(|(landmark, point)| Correspondence {
                keypoint: intrinsics.project(pose.0 * point).unwrap(),
                landmark,
                point,
            })
            .collect()
    }

    #[test]
    fn params_convert_back_to_the_pose() {
        let pose = pose();
        let back = pose_from_params(&pose_to_params(&pose));
        assert_relative_eq!(back.0, pose.0, epsilon = 1e-12);
    }

    #[test]
    fn frame_jacobian_matches_numeric_differentiation() {
        let mut problem = FrameProblem::new(&pose(), intrinsics(), correspondences(&pose(), &intrinsics()));
        let jacobian = problem.jacobian().unwrap();
        let numeric = differentiate_numerically(&mut problem).unwrap();
        assert_relative_eq!(jacobian, numeric, epsilon = 1e-4, max_relative = 1e-4);
    }

    #[test]
    fn frame_refinement_recovers_the_focal_length() {
        let truth = intrinsics();
        let correspondences = correspondences(&pose(), &truth);
        let problem = FrameProblem::new(&pose(), truth.scale_focals(1.05), correspondences);
        let (problem, report) = LevenbergMarquardt::new().minimize(problem);
        assert!(report.termination.was_successful());
        assert_relative_eq!(problem.intrinsics().focals[0], 800.0, epsilon = 1e-3);
    }

    #[test]
    fn points_behind_the_camera_have_a_large_residual() {
        let error = reprojection_error(
            &intrinsics(),
            &WorldToCamera(IsometryMatrix3::identity()),
            &Point3::new(0.0, 0.0, -1.0),
            &Point2::new(320.0, 240.0),
        );
        assert_eq!(error, Vector2::repeat(BEHIND_CAMERA_RESIDUAL));
    }

    #[test]
    fn bundle_jacobian_matches_numeric_differentiation() {
        let points = grid();
        let poses = [pose(), WorldToCamera(IsometryMatrix3::translation(0.2, 0.0, 0.0))];
        let mut observations = vec![];
        for (pose_index, pose) in poses.iter().enumerate() {
            for (index, point) in points.iter().enumerate() {
                let landmark = if index % 2 == 0 {
                    BundleLandmark::Free(index / 2)
                } else {
                    BundleLandmark::Fixed(*point)
                };
                observations.push(BundleObservation {
                    pose: pose_index,
                    landmark,
                    pixel: intrinsics().project(pose.0 * point).unwrap() + Vector2::new(0.5, -0.25),
                });
            }
        }
        let free = points.iter().step_by(2).copied().collect();
        let mut problem = BundleProblem::new(intrinsics(), &poses, free, observations, 10.0);
        let jacobian = problem.jacobian().unwrap();
        let numeric = differentiate_numerically(&mut problem).unwrap();
        assert_relative_eq!(jacobian, numeric, epsilon = 1e-4, max_relative = 1e-4);
    }
}
