use crate::Error;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the candidates retrieved from the vocabulary are turned into a pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Resect against each candidate in retrieval order and keep the first pose found.
    FirstBest,
    /// Resect against every candidate and keep the pose with the most inliers.
    BestResult,
    /// Resect once against the matches of all candidates together.
    AllResults,
    /// Resect once against the landmarks matched through several candidates.
    Cluster,
}

impl FromStr for Algorithm {
    type Err = Error;

    /// Accepts the algorithm name (case insensitive) or its number.
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "firstbest" | "0" => Ok(Algorithm::FirstBest),
            "bestresult" | "1" => Ok(Algorithm::BestResult),
            "allresults" | "2" => Ok(Algorithm::AllResults),
            "cluster" | "3" => Ok(Algorithm::Cluster),
            _ => Err(Error::InvalidValue {
                what: "algorithm",
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The density of the features extracted from each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeaturePreset {
    Low,
    Medium,
    Normal,
    High,
    Ultra,
}

impl FeaturePreset {
    /// The AKAZE detector threshold for this preset.
    ///
    /// 0.01 is very sparse and 0.0001 is very dense.
    pub fn akaze_threshold(self) -> f64 {
        match self {
            FeaturePreset::Low => 0.01,
            FeaturePreset::Medium => 0.003,
            FeaturePreset::Normal => 0.001,
            FeaturePreset::High => 0.0003,
            FeaturePreset::Ultra => 0.0001,
        }
    }
}

impl FromStr for FeaturePreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(FeaturePreset::Low),
            "medium" => Ok(FeaturePreset::Medium),
            "normal" => Ok(FeaturePreset::Normal),
            "high" => Ok(FeaturePreset::High),
            "ultra" => Ok(FeaturePreset::Ultra),
            _ => Err(Error::InvalidValue {
                what: "feature preset",
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for FeaturePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The settings for localizing a single frame.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizerSettings {
    /// The number of most similar views to retrieve from the vocabulary.
    #[serde(default = "default_retrieval_candidate_count")]
    pub retrieval_candidate_count: usize,
    /// The minimum number of retrieved views a landmark must be matched through to be used by
    /// [`Algorithm::Cluster`].
    #[serde(default = "default_min_common_views")]
    pub min_common_views: usize,
    #[serde(default = "default_feature_preset")]
    pub feature_preset: FeaturePreset,
    /// Refine the focal length of every localized frame.
    #[serde(default)]
    pub refine_intrinsics: bool,
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    /// The maximum Hamming distance of a descriptor match.
    #[serde(default = "default_match_maximum_distance")]
    pub match_maximum_distance: u32,
    /// The difference between the first and second best match above which a match is accepted.
    #[serde(default = "default_match_better_by")]
    pub match_better_by: u32,
    /// The cosine distance below which a correspondence is an inlier of a pose.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// The minimum number of 2D-3D matches needed to attempt resection.
    #[serde(default = "default_resection_minimum_matches")]
    pub resection_minimum_matches: usize,
    /// The minimum number of inliers for a pose to be accepted.
    #[serde(default = "default_resection_minimum_inliers")]
    pub resection_minimum_inliers: usize,
    /// The maximum evaluations (in multiples of the parameter count) for per-frame intrinsics refinement.
    #[serde(default = "default_intrinsics_patience")]
    pub intrinsics_patience: usize,
    /// Seed of the random number generator used for sample consensus.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for LocalizerSettings {
    fn default() -> Self {
        Self {
            retrieval_candidate_count: default_retrieval_candidate_count(),
            min_common_views: default_min_common_views(),
            feature_preset: default_feature_preset(),
            refine_intrinsics: false,
            algorithm: default_algorithm(),
            match_maximum_distance: default_match_maximum_distance(),
            match_better_by: default_match_better_by(),
            consensus_threshold: default_consensus_threshold(),
            resection_minimum_matches: default_resection_minimum_matches(),
            resection_minimum_inliers: default_resection_minimum_inliers(),
            intrinsics_patience: default_intrinsics_patience(),
            seed: default_seed(),
        }
    }
}

/// The settings for the bundle adjustment over a whole sequence.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementSettings {
    /// The maximum number of landmarks whose positions are refined.
    ///
    /// Landmarks beyond this number still constrain the poses but stay fixed.
    #[serde(default = "default_max_landmarks")]
    pub max_landmarks: usize,
    /// The maximum number of observations used from each frame.
    #[serde(default = "default_max_observations_per_frame")]
    pub max_observations_per_frame: usize,
    /// The minimum number of frames observing a landmark for its position to be refined.
    #[serde(default = "default_min_landmark_observations")]
    pub min_landmark_observations: usize,
    /// The weight (in pixels per map unit) of the prior that keeps refined landmarks near the map.
    #[serde(default = "default_structure_prior_weight")]
    pub structure_prior_weight: f64,
    /// The maximum evaluations (in multiples of the parameter count) of the solver.
    #[serde(default = "default_patience")]
    pub patience: usize,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            max_landmarks: default_max_landmarks(),
            max_observations_per_frame: default_max_observations_per_frame(),
            min_landmark_observations: default_min_landmark_observations(),
            structure_prior_weight: default_structure_prior_weight(),
            patience: default_patience(),
        }
    }
}

/// Everything the pipeline needs to know to process a sequence.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub localizer: LocalizerSettings,
    #[serde(default)]
    pub refinement: RefinementSettings,
    /// Run a bundle adjustment over the localized sequence once every frame is processed.
    #[serde(default)]
    pub refine_sequence: bool,
}

impl PipelineSettings {
    /// Loads the settings from a JSON file. Missing fields take their default values.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::SettingsIo {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| Error::SettingsJson {
            path: path.to_owned(),
            source,
        })
    }

    /// Checks the settings for combinations that can not run.
    ///
    /// Sequence refinement shares one set of intrinsics between all frames, which contradicts
    /// refining the intrinsics of every frame individually.
    pub fn validate(&self) -> Result<(), Error> {
        if self.refine_sequence && self.localizer.refine_intrinsics {
            return Err(Error::ConflictingRefinement);
        }
        if self.localizer.retrieval_candidate_count == 0 {
            return Err(Error::InvalidValue {
                what: "retrieval candidate count",
                value: "0".to_owned(),
            });
        }
        Ok(())
    }
}

fn default_retrieval_candidate_count() -> usize {
    4
}

fn default_min_common_views() -> usize {
    3
}

fn default_feature_preset() -> FeaturePreset {
    FeaturePreset::Normal
}

fn default_algorithm() -> Algorithm {
    Algorithm::FirstBest
}

fn default_match_maximum_distance() -> u32 {
    120
}

fn default_match_better_by() -> u32 {
    16
}

fn default_consensus_threshold() -> f64 {
    0.00001
}

fn default_resection_minimum_matches() -> usize {
    12
}

fn default_resection_minimum_inliers() -> usize {
    8
}

fn default_intrinsics_patience() -> usize {
    100
}

fn default_seed() -> u64 {
    5
}

fn default_max_landmarks() -> usize {
    128
}

fn default_max_observations_per_frame() -> usize {
    24
}

fn default_min_landmark_observations() -> usize {
    2
}

fn default_structure_prior_weight() -> f64 {
    10.0
}

fn default_patience() -> usize {
    100
}
