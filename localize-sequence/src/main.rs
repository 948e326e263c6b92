use cv_localize::{
    Algorithm, BundleRefiner, Error, ExportFormat, FeaturePreset, FileExportTarget, ImageSequence,
    MapLocalizer, MapPaths, PipelineDriver, PipelineSettings,
};
use log::*;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "localize-sequence",
    about = "Localizes every frame of an image sequence in an existing reconstruction"
)]
struct Opt {
    /// The JSON file where settings are specified.
    ///
    /// This is in the format of `cv_localize::PipelineSettings`. Missing fields take their
    /// default values and the options below override it.
    #[structopt(long)]
    settings: Option<PathBuf>,
    /// The number of most similar views retrieved for each frame.
    #[structopt(long)]
    results: Option<usize>,
    /// The number of retrieved views a landmark must be matched through for the cluster algorithm.
    #[structopt(long)]
    commonviews: Option<usize>,
    /// The feature density: low, medium, normal, high or ultra.
    #[structopt(long)]
    preset: Option<FeaturePreset>,
    /// The localization algorithm: FirstBest, BestResult, AllResults or Cluster (or 0 to 3).
    #[structopt(long)]
    algorithm: Option<Algorithm>,
    /// Refine the focal length of every localized frame.
    #[structopt(long)]
    refine_intrinsics: bool,
    /// Bundle adjust the whole sequence once every frame is localized.
    #[structopt(long)]
    global_bundle: bool,
    /// A JSON calibration applied to every frame.
    ///
    /// Without calibration, intrinsics are guessed from the image size.
    #[structopt(long)]
    calibration: Option<PathBuf>,
    /// The vocabulary tree.
    #[structopt(long)]
    voctree: PathBuf,
    /// Word weights replacing the ones of the vocabulary tree.
    #[structopt(long)]
    weights: Option<PathBuf>,
    /// The reconstruction to localize in.
    #[structopt(long)]
    sfmdata: PathBuf,
    /// The directory of the view descriptors, `matches` next to the reconstruction by default.
    #[structopt(long)]
    descriptors: Option<PathBuf>,
    /// The frames: a directory of images, a text file listing images, or a single image.
    #[structopt(long)]
    mediafile: PathBuf,
    /// The trajectory output. The refined trajectory is written next to it with a `.BUNDLE` suffix.
    #[structopt(long, default_value = "trackedcameras.json")]
    export: PathBuf,
    /// The output format: json, ply or none.
    #[structopt(long, default_value = "json")]
    format: ExportFormat,
}

impl Opt {
    fn pipeline_settings(&self) -> Result<PipelineSettings, Error> {
        let mut settings = match &self.settings {
            Some(path) => {
                let settings = PipelineSettings::open(path)?;
                info!("loaded settings from {}", path.display());
                settings
            }
            None => {
                info!("used default settings");
                PipelineSettings::default()
            }
        };
        if let Some(results) = self.results {
            settings.localizer.retrieval_candidate_count = results;
        }
        if let Some(commonviews) = self.commonviews {
            settings.localizer.min_common_views = commonviews;
        }
        if let Some(preset) = self.preset {
            settings.localizer.feature_preset = preset;
        }
        if let Some(algorithm) = self.algorithm {
            settings.localizer.algorithm = algorithm;
        }
        settings.localizer.refine_intrinsics |= self.refine_intrinsics;
        settings.refine_sequence |= self.global_bundle;
        Ok(settings)
    }
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    if let Err(e) = run(&opt) {
        error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(opt: &Opt) -> Result<(), Error> {
    let settings = opt.pipeline_settings()?;
    settings.validate()?;
    match serde_json::to_string_pretty(&settings) {
        Ok(json) => info!("effective settings: {}", json),
        Err(e) => warn!("unable to display the settings: {}", e),
    }
    info!("media: {}", opt.mediafile.display());
    info!("reconstruction: {}", opt.sfmdata.display());
    info!("vocabulary: {}", opt.voctree.display());

    let mut frames = ImageSequence::open(&opt.mediafile, opt.calibration.as_deref())?;

    info!("loading the map");
    let mut localizer = MapLocalizer::open(&MapPaths {
        scene: opt.sfmdata.clone(),
        descriptors: opt.descriptors.clone(),
        vocabulary: opt.voctree.clone(),
        weights: opt.weights.clone(),
    })?;
    info!(
        "loaded {} views and {} landmarks",
        localizer.scene().views().len(),
        localizer.scene().landmarks().len()
    );

    let mut refiner = BundleRefiner::new(settings.refinement);
    let mut target = FileExportTarget::new(&opt.export, opt.format);

    let summary = PipelineDriver::new(settings).run(
        &mut frames,
        &mut localizer,
        &mut refiner,
        &mut target,
    )?;
    println!("{}", summary);
    Ok(())
}
