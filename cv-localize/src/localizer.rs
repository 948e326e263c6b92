use crate::{
    reprojection::{cost, FrameProblem},
    Algorithm, Correspondence, Descriptor, Diagnostics, Error, Frame, Intrinsics,
    LocalizationOutcome, LocalizerSettings, Scene, ScenePoint, VocabularyTree, ViewDatabase,
};
use akaze::Akaze;
use arrsac::Arrsac;
use cv_core::nalgebra::Point2;
use cv_core::sample_consensus::Consensus;
use cv_core::{FeatureWorldMatch, Projective, WorldPoint, WorldToCamera};
use image::GenericImageView;
use itertools::Itertools;
use lambda_twist::LambdaTwist;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::*;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Estimates the pose of a single frame.
///
/// Construction of a localizer is its initialization and must fail if the map can not be used.
/// Localization itself never fails with an error, a frame that can not be localized produces
/// an invalid outcome.
pub trait Localizer {
    /// Localizes a frame.
    ///
    /// When `use_frame_intrinsics` is set, the calibration of the frame is used. Otherwise the
    /// localizer falls back to intrinsics guessed from the image.
    fn localize(
        &mut self,
        frame: &Frame,
        settings: &LocalizerSettings,
        use_frame_intrinsics: bool,
    ) -> LocalizationOutcome;

    /// The points of the map, for exporters that can draw them.
    fn scene_points(&self) -> Vec<ScenePoint> {
        vec![]
    }
}

impl<L> Localizer for Box<L>
where
    L: Localizer + ?Sized,
{
    fn localize(
        &mut self,
        frame: &Frame,
        settings: &LocalizerSettings,
        use_frame_intrinsics: bool,
    ) -> LocalizationOutcome {
        (**self).localize(frame, settings, use_frame_intrinsics)
    }

    fn scene_points(&self) -> Vec<ScenePoint> {
        (**self).scene_points()
    }
}

/// The files making up a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapPaths {
    pub scene: PathBuf,
    /// The directory of the view descriptors, `matches` next to the scene by default.
    pub descriptors: Option<PathBuf>,
    pub vocabulary: PathBuf,
    /// Word weights replacing the ones of the vocabulary.
    pub weights: Option<PathBuf>,
}

/// A keypoint of a frame matched to a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Match {
    feature: usize,
    landmark: usize,
    distance: u32,
}

/// Localizes frames in a [`Scene`] with vocabulary retrieval and P3P resection.
#[derive(Debug, Clone)]
pub struct MapLocalizer {
    scene: Scene,
    vocabulary: VocabularyTree,
    database: ViewDatabase,
}

impl MapLocalizer {
    /// Loads the scene and the vocabulary of a map.
    pub fn open(paths: &MapPaths) -> Result<Self, Error> {
        let scene = Scene::open(&paths.scene, paths.descriptors.as_deref())?;
        let vocabulary = VocabularyTree::open(&paths.vocabulary, paths.weights.as_deref())?;
        Ok(Self::new(scene, vocabulary))
    }

    /// Indexes the views of the scene with the vocabulary.
    ///
    /// If every word of the vocabulary has the same weight, inverse document frequencies are
    /// computed from the views of the scene.
    pub fn new(scene: Scene, mut vocabulary: VocabularyTree) -> Self {
        let uniform = (0..vocabulary.word_count())
            .map(|word| vocabulary.weight(word))
            .tuple_windows()
            .all(|(a, b)| a == b);
        if uniform {
            info!("computing word weights from {} views", scene.views().len());
            vocabulary.set_idf_weights(scene.views().iter().map(|view| &view.descriptors));
        }
        let mut database = ViewDatabase::new();
        for view in scene.views() {
            database.add(vocabulary.bag(&view.descriptors));
        }
        Self {
            scene,
            vocabulary,
            database,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Localizes a frame from its keypoints (in pixels) and their descriptors.
    pub fn localize_features(
        &self,
        frame_index: usize,
        identifier: &str,
        features: &[(Point2<f64>, Descriptor)],
        intrinsics: Intrinsics,
        settings: &LocalizerSettings,
    ) -> LocalizationOutcome {
        let mut diagnostics = Diagnostics::default();
        let bag = self.vocabulary.bag(features.iter().map(|(_, descriptor)| descriptor));
        let candidates = self
            .database
            .query(&bag, settings.retrieval_candidate_count);
        diagnostics.candidates = candidates.iter().map(|&(view, _)| view).collect();
        debug!(
            "retrieved candidate views {:?}",
            candidates
                .iter()
                .map(|&(view, score)| format!("{} ({:.3})", self.scene.view(view).name, score))
                .collect::<Vec<_>>()
        );

        let mut consensus = Arrsac::new(
            settings.consensus_threshold,
            Pcg64::seed_from_u64(settings.seed ^ frame_index as u64),
        );
        let candidate_matches: Vec<Vec<Match>> = diagnostics
            .candidates
            .iter()
            .map(|&view| self.match_view(features, view, settings))
            .collect();

        let resection = match settings.algorithm {
            Algorithm::FirstBest => {
                let mut found = None;
                for (view, matches) in diagnostics.candidates.iter().zip(&candidate_matches) {
                    diagnostics.matches += matches.len();
                    found = self.resect(features, matches, &intrinsics, settings, &mut consensus);
                    if found.is_some() {
                        debug!("localized with view {}", self.scene.view(*view).name);
                        break;
                    }
                }
                found
            }
            Algorithm::BestResult => {
                diagnostics.matches = candidate_matches.iter().map(Vec::len).sum();
                candidate_matches
                    .iter()
                    .filter_map(|matches| {
                        self.resect(features, matches, &intrinsics, settings, &mut consensus)
                    })
                    .max_by_key(|(_, inliers)| inliers.len())
            }
            Algorithm::AllResults => {
                let matches = deduplicate(candidate_matches.into_iter().flatten());
                diagnostics.matches = matches.len();
                self.resect(features, &matches, &intrinsics, settings, &mut consensus)
            }
            Algorithm::Cluster => {
                let mut views_per_landmark: HashMap<usize, usize> = HashMap::new();
                for matches in &candidate_matches {
                    for landmark in matches.iter().map(|m| m.landmark).unique() {
                        *views_per_landmark.entry(landmark).or_insert(0) += 1;
                    }
                }
                let matches = deduplicate(candidate_matches.into_iter().flatten().filter(|m| {
                    views_per_landmark[&m.landmark] >= settings.min_common_views
                }));
                diagnostics.matches = matches.len();
                self.resect(features, &matches, &intrinsics, settings, &mut consensus)
            }
        };

        let (pose, inliers) = match resection {
            Some(resection) => resection,
            None => {
                return LocalizationOutcome::failed(frame_index, identifier, intrinsics, diagnostics)
            }
        };

        let (pose, intrinsics) = if settings.refine_intrinsics {
            refine_frame_intrinsics(pose, intrinsics, &inliers, settings)
        } else {
            (pose, intrinsics)
        };
        diagnostics.inliers = inliers;
        LocalizationOutcome::localized(frame_index, identifier, pose, intrinsics, diagnostics)
    }

    /// Matches the features of a frame with the landmarks observed by a view.
    ///
    /// A feature matches its closest landmark descriptor if it is within the maximum distance
    /// and closer than the second closest by `match_better_by`.
    fn match_view(
        &self,
        features: &[(Point2<f64>, Descriptor)],
        view: usize,
        settings: &LocalizerSettings,
    ) -> Vec<Match> {
        let view_descriptors = &self.scene.view(view).descriptors;
        let landmarks = self.scene.view_landmarks(view);
        let matches = features.iter().enumerate().filter_map(|(feature, (_, descriptor))| {
            let mut best: Option<(u32, usize)> = None;
            let mut second = u32::MAX;
            for &(view_feature, landmark) in landmarks {
                let distance = descriptor.distance(&view_descriptors[view_feature]);
                match best {
                    Some((best_distance, _)) if distance >= best_distance => {
                        second = second.min(distance);
                    }
                    _ => {
                        if let Some((best_distance, _)) = best {
                            second = best_distance;
                        }
                        best = Some((distance, landmark));
                    }
                }
            }
            let (distance, landmark) = best?;
            (distance <= settings.match_maximum_distance
                && second.saturating_sub(distance) >= settings.match_better_by)
                .then(|| Match {
                    feature,
                    landmark,
                    distance,
                })
        });
        deduplicate(matches)
    }

    /// Estimates a pose from matches with ARRSAC and Lambda Twist.
    fn resect(
        &self,
        features: &[(Point2<f64>, Descriptor)],
        matches: &[Match],
        intrinsics: &Intrinsics,
        settings: &LocalizerSettings,
        consensus: &mut Arrsac<Pcg64>,
    ) -> Option<(WorldToCamera, Vec<Correspondence>)> {
        if matches.len() < settings.resection_minimum_matches {
            trace!(
                "only {} matches, need {} to resect",
                matches.len(),
                settings.resection_minimum_matches
            );
            return None;
        }
        let correspondences: Vec<Correspondence> = matches
            .iter()
            .map(|m| Correspondence {
                keypoint: features[m.feature].0,
                landmark: m.landmark,
                point: self.scene.landmark(m.landmark).position,
            })
            .collect();
        let samples: Vec<FeatureWorldMatch> = correspondences
            .iter()
            .map(|correspondence| {
                FeatureWorldMatch(
                    intrinsics.calibrate(correspondence.keypoint),
                    WorldPoint::from_point(correspondence.point),
                )
            })
            .collect();
        let (pose, inliers) =
            consensus.model_inliers(&LambdaTwist::new(), samples.iter().copied())?;
        if inliers.len() < settings.resection_minimum_inliers {
            trace!(
                "only {} inliers, need {}",
                inliers.len(),
                settings.resection_minimum_inliers
            );
            return None;
        }
        let inliers = inliers
            .into_iter()
            .map(|index| correspondences[index])
            .collect();
        Some((pose, inliers))
    }
}

impl Localizer for MapLocalizer {
    fn localize(
        &mut self,
        frame: &Frame,
        settings: &LocalizerSettings,
        use_frame_intrinsics: bool,
    ) -> LocalizationOutcome {
        let intrinsics = match frame.calibration {
            Some(calibration) if use_frame_intrinsics => calibration,
            _ => Intrinsics::guess(frame.image.width(), frame.image.height()),
        };
        let (keypoints, descriptors) =
            Akaze::new(settings.feature_preset.akaze_threshold()).extract(&frame.image);
        let features: Vec<(Point2<f64>, Descriptor)> = keypoints
            .iter()
            .zip(descriptors.iter())
            .map(|(keypoint, descriptor)| {
                let (x, y) = keypoint.point;
                (Point2::new(x as f64, y as f64), Descriptor::from(*descriptor))
            })
            .collect();
        debug!("extracted {} features", features.len());
        self.localize_features(
            frame.index,
            &frame.identifier,
            &features,
            intrinsics,
            settings,
        )
    }

    fn scene_points(&self) -> Vec<ScenePoint> {
        self.scene.points()
    }
}

/// Keeps the closest match of every feature and of every landmark.
fn deduplicate(matches: impl IntoIterator<Item = Match>) -> Vec<Match> {
    let mut matches: Vec<Match> = matches.into_iter().collect();
    matches.sort_by_key(|m| (m.distance, m.feature, m.landmark));
    let mut features = HashSet::new();
    let mut landmarks = HashSet::new();
    matches.retain(|m| {
        if features.contains(&m.feature) || landmarks.contains(&m.landmark) {
            return false;
        }
        features.insert(m.feature);
        landmarks.insert(m.landmark);
        true
    });
    matches
}

/// Refines the pose and focal length of a frame from its inliers.
///
/// The refinement is kept only if the solver succeeds without increasing the cost.
fn refine_frame_intrinsics(
    pose: WorldToCamera,
    intrinsics: Intrinsics,
    inliers: &[Correspondence],
    settings: &LocalizerSettings,
) -> (WorldToCamera, Intrinsics) {
    let problem = FrameProblem::new(&pose, intrinsics, inliers.to_vec());
    let initial = match problem.residuals() {
        Some(residuals) => cost(&residuals),
        None => return (pose, intrinsics),
    };
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(settings.intrinsics_patience)
        .minimize(problem);
    let refined = problem.intrinsics();
    if report.termination.was_successful() && report.objective_function <= initial && refined.is_valid()
    {
        debug!(
            "refined focal length from {:.1} to {:.1} (cost {:.3} to {:.3})",
            intrinsics.focals[0], refined.focals[0], initial, report.objective_function
        );
        (problem.pose(), refined)
    } else {
        debug!("intrinsics refinement rejected: {:?}", report.termination);
        (pose, intrinsics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Landmark, View};
    use approx::assert_relative_eq;
    use cv_core::nalgebra::{IsometryMatrix3, Point3, Rotation3, Translation3};
    use rand::Rng;

    struct Synthetic {
        localizer: MapLocalizer,
        features: Vec<(Point2<f64>, Descriptor)>,
        pose: WorldToCamera,
        intrinsics: Intrinsics,
    }

    /// A scene with two views of the same landmarks and the features of a new frame seeing them.
    fn synthetic() -> Synthetic {
        let mut rng = Pcg64::seed_from_u64(7);
        let intrinsics = Intrinsics::new(700.0, [320.0, 240.0]);
        let pose = WorldToCamera(IsometryMatrix3::from_parts(
            Translation3::new(0.2, -0.1, 0.4),
            Rotation3::from_euler_angles(0.05, 0.1, -0.02),
        ));
        let points: Vec<Point3<f64>> = (0..60)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(4.0..8.0),
                )
            })
            .collect();
        let descriptors: Vec<Descriptor> = points
            .iter()
            .map(|_| {
                let mut descriptor = Descriptor::zero();
                rng.fill(&mut descriptor.bytes_mut()[..]);
                descriptor
            })
            .collect();
        let views = (0..2)
            .map(|id| View {
                id,
                name: format!("view{}", id),
                descriptors: descriptors.clone(),
            })
            .collect();
        let landmarks = points
            .iter()
            .enumerate()
            .map(|(index, &position)| Landmark {
                position,
                color: [0, 255, 0],
                observations: vec![(0, index), (1, index)],
            })
            .collect();
        let scene = Scene::new(views, landmarks).unwrap();
        let vocabulary = VocabularyTree::train(&descriptors, 4, 3, &mut rng);
        let features = points
            .iter()
            .zip(&descriptors)
            .map(|(point, descriptor)| {
                let mut descriptor = *descriptor;
                descriptor.bytes_mut()[0] ^= 0b101;
                (intrinsics.project(pose.0 * point).unwrap(), descriptor)
            })
            .collect();
        Synthetic {
            localizer: MapLocalizer::new(scene, vocabulary),
            features,
            pose,
            intrinsics,
        }
    }

    #[test]
    fn every_algorithm_recovers_the_pose() {
        let synthetic = synthetic();
        for algorithm in [
            Algorithm::FirstBest,
            Algorithm::BestResult,
            Algorithm::AllResults,
            Algorithm::Cluster,
        ] {
            let settings = LocalizerSettings {
                algorithm,
                min_common_views: 2,
                ..LocalizerSettings::default()
            };
            let outcome = synthetic.localizer.localize_features(
                3,
                "frame.png",
                &synthetic.features,
                synthetic.intrinsics,
                &settings,
            );
            assert!(outcome.is_valid(), "{:?} failed to localize", algorithm);
            assert_eq!(outcome.frame_index, 3);
            assert_eq!(outcome.diagnostics.candidates.len(), 2);
            assert!(outcome.diagnostics.inliers.len() >= 50);
            let pose = outcome.pose.unwrap();
            assert_relative_eq!(pose.0, synthetic.pose.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn unknown_features_fail_to_localize() {
        let synthetic = synthetic();
        let mut rng = Pcg64::seed_from_u64(11);
        let features: Vec<(Point2<f64>, Descriptor)> = synthetic
            .features
            .iter()
            .map(|&(keypoint, _)| {
                let mut descriptor = Descriptor::zero();
                rng.fill(&mut descriptor.bytes_mut()[..]);
                (keypoint, descriptor)
            })
            .collect();
        let outcome = synthetic.localizer.localize_features(
            0,
            "noise.png",
            &features,
            synthetic.intrinsics,
            &LocalizerSettings::default(),
        );
        assert!(!outcome.is_valid());
        assert_eq!(outcome.intrinsics, Some(synthetic.intrinsics));
        assert!(outcome.diagnostics.inliers.is_empty());
    }

    #[test]
    fn frame_intrinsics_refinement_corrects_the_focal_length() {
        let synthetic = synthetic();
        // The wrong focal length bends the bearings, so inliers need a looser threshold.
        let settings = LocalizerSettings {
            refine_intrinsics: true,
            consensus_threshold: 1e-3,
            ..LocalizerSettings::default()
        };
        let outcome = synthetic.localizer.localize_features(
            0,
            "frame.png",
            &synthetic.features,
            synthetic.intrinsics.scale_focals(1.02),
            &settings,
        );
        let intrinsics = outcome.intrinsics.unwrap();
        assert!((intrinsics.focals[0] - 700.0).abs() < (714.0 - 700.0));
    }

    #[test]
    fn duplicate_matches_keep_the_closest() {
        let matches = deduplicate(vec![
            Match {
                feature: 0,
                landmark: 4,
                distance: 30,
            },
            Match {
                feature: 1,
                landmark: 4,
                distance: 10,
            },
            Match {
                feature: 1,
                landmark: 5,
                distance: 20,
            },
        ]);
        assert_eq!(
            matches,
            [Match {
                feature: 1,
                landmark: 4,
                distance: 10,
            }]
        );
    }
}
