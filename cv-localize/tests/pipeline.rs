use cv_core::nalgebra::IsometryMatrix3;
use cv_core::WorldToCamera;
use cv_localize::{
    Diagnostics, Error, ExportFormat, ExportTarget, FileExportTarget, Frame, FrameSource,
    Intrinsics, LocalizationOutcome, Localizer, LocalizerSettings, PipelineDriver,
    PipelineSettings, RefinementStatus, RunSummary, ScenePoint, SequenceRefiner,
    TrajectoryEntry, TrajectoryExporter, TrajectoryVariant,
};
use image::DynamicImage;
use quickcheck_macros::quickcheck;
use std::cell::RefCell;
use std::rc::Rc;

/// Yields blank frames, failing with a read error at `fail_at` if set.
struct Frames {
    count: usize,
    fail_at: Option<usize>,
    next: usize,
}

impl Frames {
    fn new(count: usize) -> Self {
        Self {
            count,
            fail_at: None,
            next: 0,
        }
    }
}

impl FrameSource for Frames {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let index = self.next;
        if Some(index) == self.fail_at {
            return Err(Error::MediaIo {
                path: format!("{}.png", index).into(),
                source: std::io::ErrorKind::UnexpectedEof.into(),
            });
        }
        if index == self.count {
            return Ok(None);
        }
        self.next += 1;
        Ok(Some(Frame {
            index,
            image: DynamicImage::new_luma8(4, 4),
            calibration: None,
            identifier: format!("{}.png", index),
        }))
    }
}

/// Localizes the frames whose index is flagged as valid.
struct Scripted {
    validity: Vec<bool>,
}

impl Localizer for Scripted {
    fn localize(&mut self, frame: &Frame, _: &LocalizerSettings, _: bool) -> LocalizationOutcome {
        if self.validity[frame.index] {
            LocalizationOutcome::localized(
                frame.index,
                frame.identifier.clone(),
                WorldToCamera(IsometryMatrix3::translation(frame.index as f64, 0.0, 0.0)),
                Intrinsics::guess(4, 4),
                Diagnostics::default(),
            )
        } else {
            LocalizationOutcome::failed(
                frame.index,
                frame.identifier.clone(),
                Intrinsics::guess(8, 8),
                Diagnostics::default(),
            )
        }
    }

    fn scene_points(&self) -> Vec<ScenePoint> {
        vec![ScenePoint {
            position: [0.0, 0.0, 5.0].into(),
            color: [255, 255, 255],
        }]
    }
}

/// Records the sizes of the sequences it was asked to refine.
#[derive(Default)]
struct Recorder {
    calls: Vec<usize>,
    succeed: bool,
}

impl SequenceRefiner for Recorder {
    fn refine_sequence(&mut self, _: &Intrinsics, outcomes: &mut [LocalizationOutcome]) -> bool {
        assert!(outcomes.iter().all(LocalizationOutcome::is_valid));
        self.calls.push(outcomes.len());
        self.succeed
    }
}

#[derive(Debug, Default)]
struct Output {
    entries: Vec<TrajectoryEntry>,
    points: usize,
    finished: bool,
}

/// Keeps whatever is exported in memory, one output per variant.
#[derive(Default)]
struct Memory {
    raw: Option<Rc<RefCell<Output>>>,
    refined: Option<Rc<RefCell<Output>>>,
}

struct MemoryExporter(Rc<RefCell<Output>>);

impl TrajectoryExporter for MemoryExporter {
    fn can_export_trajectory(&self) -> bool {
        true
    }

    fn can_export_points(&self) -> bool {
        true
    }

    fn append_entry(&mut self, entry: &TrajectoryEntry) -> Result<(), Error> {
        let mut output = self.0.borrow_mut();
        assert!(!output.finished);
        output.entries.push(entry.clone());
        Ok(())
    }

    fn append_points(&mut self, points: &[ScenePoint]) -> Result<(), Error> {
        self.0.borrow_mut().points += points.len();
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.0.borrow_mut().finished = true;
        Ok(())
    }
}

impl ExportTarget for Memory {
    fn open(&mut self, variant: TrajectoryVariant) -> Result<Box<dyn TrajectoryExporter>, Error> {
        let output = Rc::new(RefCell::new(Output::default()));
        let slot = match variant {
            TrajectoryVariant::Raw => &mut self.raw,
            TrajectoryVariant::Refined => &mut self.refined,
        };
        assert!(slot.is_none(), "{:?} opened twice", variant);
        *slot = Some(output.clone());
        Ok(Box::new(MemoryExporter(output)))
    }
}

impl Memory {
    fn labels(output: &Option<Rc<RefCell<Output>>>) -> Vec<String> {
        output
            .as_ref()
            .map(|output| {
                output
                    .borrow()
                    .entries
                    .iter()
                    .map(|entry| entry.label.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn settings(refine_sequence: bool) -> PipelineSettings {
    PipelineSettings {
        refine_sequence,
        ..PipelineSettings::default()
    }
}

fn run(
    validity: &[bool],
    settings: PipelineSettings,
    refiner: &mut Recorder,
    target: &mut Memory,
) -> Result<RunSummary, Error> {
    PipelineDriver::new(settings).run(
        &mut Frames::new(validity.len()),
        &mut Scripted {
            validity: validity.to_vec(),
        },
        refiner,
        target,
    )
}

#[test]
fn one_failed_frame_among_three() {
    let mut refiner = Recorder {
        succeed: true,
        ..Recorder::default()
    };
    let mut target = Memory::default();
    let summary = run(&[true, false, true], settings(true), &mut refiner, &mut target).unwrap();

    assert_eq!(summary.frames_processed, 3);
    assert_eq!(summary.valid_count, 2);
    assert_eq!(summary.invalid_count, 1);
    assert_eq!(summary.timing.count(), 3);
    assert_eq!(summary.refinement, RefinementStatus::Refined { frames: 2 });
    assert!(!summary.stream_interrupted);
    assert_eq!(refiner.calls, vec![2]);

    let expected = vec!["camera.0000", "camera.V.0001", "camera.0002"];
    assert_eq!(Memory::labels(&target.raw), expected);
    assert_eq!(Memory::labels(&target.refined), expected);
    for output in [&target.raw, &target.refined] {
        let output = output.as_ref().unwrap().borrow();
        assert!(output.finished);
        assert_eq!(output.points, 1);
        let placeholder = &output.entries[1];
        assert!(!placeholder.valid);
        assert_eq!(placeholder.pose.0, IsometryMatrix3::identity());
    }
}

#[test]
fn placeholders_carry_intrinsics() {
    let mut refiner = Recorder {
        succeed: true,
        ..Recorder::default()
    };
    let mut target = Memory::default();
    run(&[false, true, false], settings(true), &mut refiner, &mut target).unwrap();

    let raw = target.raw.as_ref().unwrap().borrow();
    for index in [0, 2] {
        assert_eq!(raw.entries[index].intrinsics, Some(Intrinsics::guess(8, 8)));
    }
    let refined = target.refined.as_ref().unwrap().borrow();
    for entry in &refined.entries {
        assert_eq!(entry.intrinsics, Some(Intrinsics::guess(4, 4)));
    }
}

#[test]
fn no_valid_frame_skips_refinement() {
    let mut refiner = Recorder::default();
    let mut target = Memory::default();
    let summary = run(&[false; 5], settings(true), &mut refiner, &mut target).unwrap();

    assert_eq!(summary.frames_processed, 5);
    assert_eq!(summary.valid_count, 0);
    assert_eq!(summary.refinement, RefinementStatus::Skipped);
    assert!(refiner.calls.is_empty());
    assert!(target.refined.is_none());
    assert_eq!(Memory::labels(&target.raw).len(), 5);
}

#[test]
fn refinement_conflicts_with_intrinsics_refinement() {
    let mut settings = settings(true);
    settings.localizer.refine_intrinsics = true;
    let mut frames = Frames::new(3);
    let mut target = Memory::default();
    let error = PipelineDriver::new(settings)
        .run(
            &mut frames,
            &mut Scripted {
                validity: vec![true; 3],
            },
            &mut Recorder::default(),
            &mut target,
        )
        .unwrap_err();

    assert!(matches!(error, Error::ConflictingRefinement));
    assert_eq!(error.exit_code(), 4);
    assert_eq!(frames.next, 0);
    assert!(target.raw.is_none());
}

#[test]
fn disabled_and_failed_refinements_keep_the_raw_trajectory() {
    let mut refiner = Recorder::default();
    let mut target = Memory::default();
    let summary = run(&[true, true], settings(false), &mut refiner, &mut target).unwrap();
    assert_eq!(summary.refinement, RefinementStatus::Disabled);
    assert!(refiner.calls.is_empty());

    let mut target = Memory::default();
    let summary = run(&[true, false, true], settings(true), &mut refiner, &mut target).unwrap();
    assert_eq!(summary.refinement, RefinementStatus::Failed);
    assert_eq!(refiner.calls, vec![2]);
    assert!(target.refined.is_none());
    assert_eq!(Memory::labels(&target.raw).len(), 3);
    assert!(target.raw.as_ref().unwrap().borrow().finished);
}

#[test]
fn read_errors_interrupt_the_stream() {
    let mut frames = Frames {
        count: 5,
        fail_at: Some(2),
        next: 0,
    };
    let mut target = Memory::default();
    let summary = PipelineDriver::new(settings(false))
        .run(
            &mut frames,
            &mut Scripted {
                validity: vec![true; 5],
            },
            &mut Recorder::default(),
            &mut target,
        )
        .unwrap();
    assert!(summary.stream_interrupted);
    assert_eq!(summary.frames_processed, 2);
    assert!(target.raw.as_ref().unwrap().borrow().finished);
}

#[test]
fn validity_is_reproducible() {
    let validity = [true, false, false, true, true, false];
    let flags = || {
        let mut target = Memory::default();
        run(&validity, settings(false), &mut Recorder::default(), &mut target).unwrap();
        let output = target.raw.unwrap();
        let flags: Vec<bool> = output.borrow().entries.iter().map(|entry| entry.valid).collect();
        flags
    };
    let first = flags();
    assert_eq!(first, validity);
    assert_eq!(first, flags());
}

#[test]
fn files_are_written_for_both_variants() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trajectory.json");
    let mut target = FileExportTarget::new(&path, ExportFormat::JsonLines);
    let mut refiner = Recorder {
        succeed: true,
        ..Recorder::default()
    };
    let summary = PipelineDriver::new(settings(true))
        .run(
            &mut Frames::new(3),
            &mut Scripted {
                validity: vec![false, true, true],
            },
            &mut refiner,
            &mut target,
        )
        .unwrap();
    assert_eq!(summary.refinement, RefinementStatus::Refined { frames: 2 });

    let raw = std::fs::read_to_string(&path).unwrap();
    let refined = std::fs::read_to_string(dir.path().join("trajectory.BUNDLE.json")).unwrap();
    assert_eq!(raw.lines().count(), 3);
    assert_eq!(refined.lines().count(), 3);
    assert!(refined.lines().next().unwrap().contains("camera.V.0000"));
}

#[test]
fn unwritable_exports_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut target = FileExportTarget::new(
        dir.path().join("missing").join("trajectory.json"),
        ExportFormat::JsonLines,
    );
    let error = PipelineDriver::new(settings(false))
        .run(
            &mut Frames::new(1),
            &mut Scripted {
                validity: vec![true],
            },
            &mut Recorder::default(),
            &mut target,
        )
        .unwrap_err();
    assert_eq!(error.exit_code(), 5);
}

#[quickcheck]
fn trajectories_stay_aligned_with_the_frames(validity: Vec<bool>) -> bool {
    let mut refiner = Recorder {
        succeed: true,
        ..Recorder::default()
    };
    let mut target = Memory::default();
    let summary = match run(&validity, settings(true), &mut refiner, &mut target) {
        Ok(summary) => summary,
        Err(_) => return false,
    };
    let valid = validity.iter().filter(|&&valid| valid).count();
    let aligned = |output: &Option<Rc<RefCell<Output>>>| {
        output.as_ref().map_or(false, |output| {
            let output = output.borrow();
            output.entries.len() == validity.len()
                && output
                    .entries
                    .iter()
                    .enumerate()
                    .all(|(index, entry)| entry.frame_index == index && entry.valid == validity[index])
        })
    };
    summary.frames_processed == validity.len()
        && summary.valid_count == valid
        && summary.valid_count + summary.invalid_count == summary.frames_processed
        && summary.timing.count() == validity.len()
        && aligned(&target.raw)
        && if valid == 0 {
            summary.refinement == RefinementStatus::Skipped && target.refined.is_none()
        } else {
            summary.refinement == RefinementStatus::Refined { frames: valid } && aligned(&target.refined)
        }
}
