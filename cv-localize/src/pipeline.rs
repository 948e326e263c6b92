use crate::{
    Error, ExportTarget, FrameSource, Localizer, PipelineSettings, RefinementResult,
    RefinementStage, SequenceRefiner, TimingAccumulator, Trajectory, TrajectoryAccumulator,
    TrajectoryEntry, TrajectoryExporter, TrajectoryVariant,
};
use core::fmt;
use log::*;
use std::time::Instant;

/// What happened to the second pass over the trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementStatus {
    /// Sequence refinement was not requested.
    Disabled,
    /// No frame was localized, so there was nothing to refine.
    Skipped,
    /// The refiner ran and did not converge. The raw trajectory is unaffected.
    Failed,
    /// The refined trajectory was exported, `frames` of which were refined.
    Refined { frames: usize },
}

impl fmt::Display for RefinementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefinementStatus::Disabled => write!(f, "disabled"),
            RefinementStatus::Skipped => write!(f, "skipped (no localized frames)"),
            RefinementStatus::Failed => write!(f, "failed"),
            RefinementStatus::Refined { frames } => write!(f, "refined {} frames", frames),
        }
    }
}

/// The outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub frames_processed: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
    pub timing: TimingAccumulator,
    pub refinement: RefinementStatus,
    /// The frame source failed before the end of the sequence.
    pub stream_interrupted: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "frames: {} ({} localized, {} failed{})",
            self.frames_processed,
            self.valid_count,
            self.invalid_count,
            if self.stream_interrupted {
                ", stream interrupted"
            } else {
                ""
            }
        )?;
        writeln!(f, "timing: {}", self.timing)?;
        write!(f, "refinement: {}", self.refinement)
    }
}

/// Localizes every frame of a sequence, then optionally refines and exports the trajectory.
///
/// The driver owns nothing but its settings. Everything it works with is handed to
/// [`PipelineDriver::run`], so any collaborator can be swapped for another implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineDriver {
    settings: PipelineSettings,
}

impl PipelineDriver {
    pub fn new(settings: PipelineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the pipeline to completion.
    ///
    /// Frames that fail to localize and a failed refinement are reported in the summary.
    /// Only invalid settings and export failures are errors. Settings are validated before
    /// the first frame is read.
    pub fn run<S, L, R, E>(
        &self,
        frames: &mut S,
        localizer: &mut L,
        refiner: &mut R,
        target: &mut E,
    ) -> Result<RunSummary, Error>
    where
        S: FrameSource,
        L: Localizer,
        R: SequenceRefiner,
        E: ExportTarget,
    {
        self.settings.validate()?;

        let mut exporter = target.open(TrajectoryVariant::Raw)?;
        append_scene_points(exporter.as_mut(), &*localizer)?;

        let mut timing = TimingAccumulator::new();
        let mut accumulator = TrajectoryAccumulator::new();
        let mut stream_interrupted = false;
        loop {
            let frame = match frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!(
                        "frame source failed after {} frames, stopping: {}",
                        accumulator.len(),
                        e
                    );
                    stream_interrupted = true;
                    break;
                }
            };
            info!("FRAME {:04}", frame.index);
            info!("processing {}", frame.identifier);

            let start = Instant::now();
            let outcome =
                localizer.localize(&frame, &self.settings.localizer, frame.has_calibration());
            let elapsed = start.elapsed();
            timing.fold_duration(frame.index, elapsed);
            info!("localization took {:.1} ms", elapsed.as_secs_f64() * 1000.0);

            if outcome.is_valid() {
                info!(
                    "localized {} with {} inliers",
                    frame.identifier,
                    outcome.diagnostics.inliers.len()
                );
            } else {
                warn!("unable to localize {}", frame.identifier);
            }
            export_entry(exporter.as_mut(), &TrajectoryEntry::from(&outcome))?;
            accumulator.append(outcome);
        }
        exporter.finish()?;

        info!(
            "localized {} of {} frames",
            accumulator.valid_count(),
            accumulator.len()
        );
        let trajectory = accumulator.into_trajectory();
        let refinement = if self.settings.refine_sequence {
            self.refine(&trajectory, &*localizer, refiner, target)?
        } else {
            RefinementStatus::Disabled
        };

        Ok(RunSummary {
            frames_processed: trajectory.len(),
            valid_count: trajectory.valid_count(),
            invalid_count: trajectory.invalid_count(),
            timing,
            refinement,
            stream_interrupted,
        })
    }

    fn refine<L, R, E>(
        &self,
        trajectory: &Trajectory,
        localizer: &L,
        refiner: &mut R,
        target: &mut E,
    ) -> Result<RefinementStatus, Error>
    where
        L: Localizer,
        R: SequenceRefiner,
        E: ExportTarget,
    {
        let intrinsics = match trajectory.last_valid_intrinsics() {
            Some(intrinsics) => intrinsics,
            None if trajectory.valid_count() == 0 => {
                info!("no localized frames, skipping sequence refinement");
                return Ok(RefinementStatus::Skipped);
            }
            None => {
                error!("localized frames carry no intrinsics, unable to refine the sequence");
                return Ok(RefinementStatus::Failed);
            }
        };

        info!("refining {} localized frames", trajectory.valid_count());
        let refined = match RefinementStage::new(refiner).refine(trajectory, &intrinsics) {
            RefinementResult::Refined(refined) => refined,
            RefinementResult::Skipped => {
                info!("no localized frames, skipping sequence refinement");
                return Ok(RefinementStatus::Skipped);
            }
            RefinementResult::Failed => {
                error!("sequence refinement failed, only the raw trajectory is exported");
                return Ok(RefinementStatus::Failed);
            }
        };

        let mut exporter = target.open(TrajectoryVariant::Refined)?;
        append_scene_points(exporter.as_mut(), localizer)?;
        for outcome in &refined {
            export_entry(exporter.as_mut(), &outcome.into())?;
        }
        exporter.finish()?;
        Ok(RefinementStatus::Refined {
            frames: refined.valid_count(),
        })
    }
}

fn append_scene_points(
    exporter: &mut dyn TrajectoryExporter,
    localizer: &impl Localizer,
) -> Result<(), Error> {
    if exporter.can_export_points() {
        let points = localizer.scene_points();
        debug!("exporting {} scene points", points.len());
        exporter.append_points(&points)?;
    }
    Ok(())
}

fn export_entry(exporter: &mut dyn TrajectoryExporter, entry: &TrajectoryEntry) -> Result<(), Error> {
    if exporter.can_export_trajectory() {
        trace!("exporting {}", entry.label);
        exporter.append_entry(entry)?;
    }
    Ok(())
}
