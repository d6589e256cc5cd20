//! [`CaptureOrchestrator`] – supervised multi-device capture.
//!
//! A *phase* moves the mount, waits for it to settle, launches one exposure
//! per camera, and resolves every launched task before the next phase may
//! start.  A *sweep* runs phases in order and always finishes with a
//! best-effort return to home.
//!
//! ## Batch resolution
//!
//! All cameras are launched before any task is waited on, so the start skew
//! across devices is only the launch loop.  Tasks are then resolved one at a
//! time in launch order.  Each task is allowed `exposure + timeout_margin`
//! measured from its own launch, which bounds the whole batch by the slowest
//! device rather than by the sum of all waits.
//!
//! | Wait result | Action |
//! |---|---|
//! | completed | post-process the artifact, resolve the next task |
//! | timed out | cancel the task, resolve the next task |
//! | failed | record the reason, resolve the next task |
//! | interrupted | cancel the task, cancel every remaining task, stop |
//!
//! Every camera of the batch gets exactly one result.  Cameras reached by
//! the launch loop after an interrupt are reported as not launched.
//!
//! ## Interruption
//!
//! Operator interruption arrives through a [`CancellationToken`].  It is a
//! control-flow signal: it is reported through the `interrupted` flag of each
//! report, never as an error.  No launched task outlives an interrupted
//! batch, and no phase starts after an interrupt was observed.
//!
//! The closing return-home of a sweep does not watch the token.  A second
//! interrupt while it runs has no effect.

use std::path::PathBuf;
use std::time::Duration;

use pocs_hal::observatory::CameraSet;
use pocs_hal::{CaptureTask, Mount, Observatory, WaitOutcome};
use pocs_types::{Coord, Direction, PocsError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::{ArtifactNamer, ArtifactProcessor, ValidateArtifact};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Timing knobs for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Added to the exposure time to get each task's wait budget.
    pub timeout_margin: Duration,
    /// Interval between `is_slewing` polls.
    pub mount_poll_interval: Duration,
    /// Give up on a mount that is still moving after this long.
    pub mount_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout_margin: Duration::from_secs(15),
            mount_poll_interval: Duration::from_secs(1),
            mount_timeout: Duration::from_secs(300),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Plans
// ────────────────────────────────────────────────────────────────────────────

/// One mount command.
#[derive(Debug, Clone, PartialEq)]
pub enum MountMove {
    Home,
    Target(Coord),
    Direction(Direction, Duration),
}

impl MountMove {
    fn issue(&self, mount: &mut dyn Mount) -> Result<(), PocsError> {
        match self {
            MountMove::Home => mount.slew_to_home(),
            MountMove::Target(coord) => mount.slew_to_target(coord),
            MountMove::Direction(direction, duration) => mount.move_direction(*direction, *duration),
        }
    }
}

/// One mount position plus one capture per camera.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    /// Prefix of every artifact name in this phase.
    pub label: String,
    /// Issued and settled before any capture starts.
    pub moves: Vec<MountMove>,
    /// Issued right after the captures are launched, while the shutters are
    /// open.  Used to trail stars across the frame.
    pub moves_during_exposure: Vec<MountMove>,
    pub exposure: Duration,
}

impl Phase {
    pub fn new(label: impl Into<String>, exposure: Duration) -> Self {
        Self {
            label: label.into(),
            moves: Vec::new(),
            moves_during_exposure: Vec::new(),
            exposure,
        }
    }

    pub fn with_move(mut self, mv: MountMove) -> Self {
        self.moves.push(mv);
        self
    }

    pub fn with_move_during_exposure(mut self, mv: MountMove) -> Self {
        self.moves_during_exposure.push(mv);
        self
    }
}

/// Exposure and motion settings for the polar alignment test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentSettings {
    /// Exposure of the frame taken at home, centred on the pole.
    pub pole_exposure: Duration,
    /// Exposure of each rotation frame.
    pub rotation_exposure: Duration,
    /// Offset applied against the first rotation direction so the trail is
    /// centred on home.
    pub rotation_offset: Duration,
    /// Length of the move made while a rotation frame is exposing.
    pub rotation_move: Duration,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            pole_exposure: Duration::from_secs(30),
            rotation_exposure: Duration::from_secs(25),
            rotation_offset: Duration::from_secs(11),
            rotation_move: Duration::from_secs(21),
        }
    }
}

/// Ordered phases of a sweep.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SweepPlan {
    pub phases: Vec<Phase>,
}

/// Label of the pole phase of a polar alignment sweep.
pub const POLE_LABEL: &str = "pole";

/// Label of the rotation phase in `direction`.
pub fn rotation_label(direction: Direction) -> String {
    format!("rotation_{direction}")
}

impl SweepPlan {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// Pole frame at home, then one trailed rotation frame per direction.
    ///
    /// Before the first rotation the mount is offset against its direction
    /// by `rotation_offset`, so the trail spans home.  Later rotations start
    /// where the previous one ended.
    pub fn polar_alignment(settings: &AlignmentSettings, directions: &[Direction]) -> Self {
        let mut phases = vec![Phase::new(POLE_LABEL, settings.pole_exposure).with_move(MountMove::Home)];
        for (i, direction) in directions.iter().copied().enumerate() {
            let mut phase = Phase::new(rotation_label(direction), settings.rotation_exposure)
                .with_move_during_exposure(MountMove::Direction(direction, settings.rotation_move));
            if i == 0 {
                phase = phase.with_move(MountMove::Home).with_move(MountMove::Direction(
                    direction.opposite(),
                    settings.rotation_offset,
                ));
            }
            phases.push(phase);
        }
        Self { phases }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

/// How one device's capture ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Completed,
    /// Waited past `exposure + margin`; the task was cancelled.
    TimedOut,
    /// The capture finished with an error.
    Failed(String),
    /// The exposure could not be started.
    LaunchFailed(String),
    /// Being waited on when the operator interrupted; cancelled.
    Interrupted,
    /// Launched but never waited on because of an earlier interrupt;
    /// cancelled.
    Abandoned,
    /// Never launched because the interrupt arrived during the launch loop.
    NotLaunched,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub device: String,
    pub path: PathBuf,
    pub outcome: CaptureOutcome,
}

/// Every device's result for one batch, in launch order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub label: String,
    pub results: Vec<CaptureResult>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn result_for(&self, device: &str) -> Option<&CaptureResult> {
        self.results.iter().find(|r| r.device == device)
    }

    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == CaptureOutcome::Completed)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub label: String,
    /// `None` when the phase was interrupted before anything was launched.
    pub batch: Option<BatchReport>,
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    /// Phases that were started, in order.
    pub phases: Vec<PhaseReport>,
    pub interrupted: bool,
    /// Whether the closing return-home settled.
    pub returned_home: bool,
}

impl SweepReport {
    pub fn phase(&self, label: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.label == label)
    }
}

/// Outcome of waiting for the mount to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountWait {
    Settled,
    Interrupted,
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

/// Poll `mount` every `mount_poll_interval` until it stops slewing.
///
/// # Errors
///
/// [`PocsError::MountTimeout`] when it is still moving after
/// `mount_timeout`.
pub async fn wait_for_mount(
    mount: &dyn Mount,
    config: &OrchestratorConfig,
    interrupt: &CancellationToken,
) -> Result<MountWait, PocsError> {
    let started = Instant::now();
    loop {
        if !mount.is_slewing() {
            return Ok(MountWait::Settled);
        }
        if started.elapsed() >= config.mount_timeout {
            return Err(PocsError::MountTimeout {
                waited: config.mount_timeout,
            });
        }
        tokio::select! {
            biased;
            () = interrupt.cancelled() => return Ok(MountWait::Interrupted),
            () = tokio::time::sleep(config.mount_poll_interval) => {}
        }
    }
}

struct Launched {
    task: Box<dyn CaptureTask>,
    deadline: Instant,
}

/// Drives the mount and cameras through phases.
///
/// Every operation takes `&mut self`, so one orchestrator never has two
/// batches outstanding.
pub struct CaptureOrchestrator {
    config: OrchestratorConfig,
    namer: ArtifactNamer,
    processor: Box<dyn ArtifactProcessor>,
}

impl CaptureOrchestrator {
    pub fn new(config: OrchestratorConfig, namer: ArtifactNamer) -> Self {
        Self {
            config,
            namer,
            processor: Box::new(ValidateArtifact),
        }
    }

    pub fn with_processor(mut self, processor: Box<dyn ArtifactProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn namer(&self) -> &ArtifactNamer {
        &self.namer
    }

    /// Give back the namer so a later run can continue its sequences.
    pub fn into_namer(self) -> ArtifactNamer {
        self.namer
    }

    /// [`wait_for_mount`] with this orchestrator's timings.
    pub async fn wait_for_mount(
        &self,
        mount: &dyn Mount,
        interrupt: &CancellationToken,
    ) -> Result<MountWait, PocsError> {
        wait_for_mount(mount, &self.config, interrupt).await
    }

    /// Launch one exposure per camera and resolve them all.
    pub async fn run_batch(
        &mut self,
        cameras: &mut CameraSet,
        exposure: Duration,
        label: &str,
        interrupt: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let (launched, mut results) = self.launch(cameras, exposure, label, interrupt);
        let interrupted = self.resolve(launched, &mut results, interrupt).await;
        let report = BatchReport {
            label: label.to_string(),
            results,
            interrupted,
            elapsed: started.elapsed(),
        };
        info!(
            label,
            completed = report.completed(),
            devices = report.results.len(),
            interrupted,
            elapsed = ?report.elapsed,
            "batch resolved"
        );
        report
    }

    /// Move, settle, and capture.
    ///
    /// # Errors
    ///
    /// A mount command failure or a mount that never settles aborts the
    /// phase before anything is launched, or before the batch is resolved
    /// when the failing move was issued during exposure.
    pub async fn run_phase(
        &mut self,
        mount: &mut dyn Mount,
        cameras: &mut CameraSet,
        phase: &Phase,
        interrupt: &CancellationToken,
    ) -> Result<PhaseReport, PocsError> {
        let interrupted = |label: &str| PhaseReport {
            label: label.to_string(),
            batch: None,
            interrupted: true,
        };

        info!(phase = %phase.label, moves = phase.moves.len(), "starting phase");
        for mv in &phase.moves {
            if interrupt.is_cancelled() {
                return Ok(interrupted(&phase.label));
            }
            mv.issue(mount)?;
            if self.wait_for_mount(mount, interrupt).await? == MountWait::Interrupted {
                return Ok(interrupted(&phase.label));
            }
        }
        if interrupt.is_cancelled() {
            return Ok(interrupted(&phase.label));
        }

        let started = Instant::now();
        let (launched, mut results) = self.launch(cameras, phase.exposure, &phase.label, interrupt);
        for mv in &phase.moves_during_exposure {
            if let Err(e) = mv.issue(mount) {
                warn!(phase = %phase.label, error = %e, "mount move during exposure failed");
                cancel_all(launched, &mut results).await;
                return Err(e);
            }
        }
        let batch_interrupted = self.resolve(launched, &mut results, interrupt).await;
        let batch = BatchReport {
            label: phase.label.clone(),
            results,
            interrupted: batch_interrupted,
            elapsed: started.elapsed(),
        };
        info!(
            phase = %phase.label,
            completed = batch.completed(),
            devices = batch.results.len(),
            interrupted = batch_interrupted,
            "phase finished"
        );
        Ok(PhaseReport {
            label: phase.label.clone(),
            batch: Some(batch),
            interrupted: batch_interrupted,
        })
    }

    /// Run every phase of `plan`, then return the mount home.
    ///
    /// Stops launching phases once an interrupt is observed.  The return
    /// home is attempted in every case, including after a failed phase.
    ///
    /// # Errors
    ///
    /// The mount failure that aborted a phase, reported after the return
    /// home was attempted.
    pub async fn run_sweep(
        &mut self,
        observatory: &mut Observatory,
        plan: &SweepPlan,
        interrupt: &CancellationToken,
    ) -> Result<SweepReport, PocsError> {
        let (mount, cameras) = observatory.split_mut();
        let mut phases = Vec::new();
        let mut interrupted = false;
        let mut failure = None;

        for phase in &plan.phases {
            if interrupt.is_cancelled() {
                interrupted = true;
                break;
            }
            match self.run_phase(mount, cameras, phase, interrupt).await {
                Ok(report) => {
                    let stop = report.interrupted;
                    phases.push(report);
                    if stop {
                        interrupted = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!(phase = %phase.label, error = %e, "phase aborted");
                    failure = Some(e);
                    break;
                }
            }
        }
        if interrupted {
            warn!("sweep interrupted by operator");
        }

        let returned_home = self.return_home(mount).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(SweepReport {
                phases,
                interrupted,
                returned_home,
            }),
        }
    }

    /// Best-effort slew home.  Not interruptible.
    async fn return_home(&self, mount: &mut dyn Mount) -> bool {
        info!("returning mount to home");
        if let Err(e) = mount.slew_to_home() {
            warn!(error = %e, "return to home failed");
            return false;
        }
        match self.wait_for_mount(mount, &CancellationToken::new()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "mount did not settle at home");
                false
            }
        }
    }

    /// Start an exposure on every camera, in camera-id order.
    fn launch(
        &mut self,
        cameras: &mut CameraSet,
        exposure: Duration,
        label: &str,
        interrupt: &CancellationToken,
    ) -> (Vec<Launched>, Vec<CaptureResult>) {
        let mut launched = Vec::with_capacity(cameras.len());
        let mut results = Vec::with_capacity(cameras.len());
        for (id, camera) in cameras.iter_mut() {
            if interrupt.is_cancelled() {
                results.push(CaptureResult {
                    device: id.clone(),
                    path: self.namer.peek_path(id, label),
                    outcome: CaptureOutcome::NotLaunched,
                });
                continue;
            }
            let path = self.namer.next_path(id, label);
            match camera.take_exposure(exposure, &path) {
                Ok(task) => launched.push(Launched {
                    task,
                    deadline: Instant::now() + exposure + self.config.timeout_margin,
                }),
                Err(e) => {
                    warn!(camera = %id, error = %e, "exposure launch failed, skipping device");
                    results.push(CaptureResult {
                        device: id.clone(),
                        path,
                        outcome: CaptureOutcome::LaunchFailed(e.to_string()),
                    });
                }
            }
        }
        info!(label, launched = launched.len(), ?exposure, "exposures launched");
        (launched, results)
    }

    /// Resolve launched tasks in order.  Returns `true` when interrupted.
    async fn resolve(
        &self,
        launched: Vec<Launched>,
        results: &mut Vec<CaptureResult>,
        interrupt: &CancellationToken,
    ) -> bool {
        let mut pending = launched.into_iter();
        while let Some(Launched { mut task, deadline }) = pending.next() {
            let budget = deadline.saturating_duration_since(Instant::now());
            let waited = tokio::select! {
                biased;
                () = interrupt.cancelled() => None,
                outcome = task.wait(budget) => Some(outcome),
            };
            let outcome = match waited {
                None => {
                    warn!(camera = %task.device_id(), "interrupted, cancelling capture");
                    task.cancel().await;
                    results.push(result_of(task.as_ref(), CaptureOutcome::Interrupted));
                    cancel_all(pending.collect(), results).await;
                    return true;
                }
                Some(WaitOutcome::Completed) => {
                    if let Err(e) = self.processor.process(task.device_id(), task.output_path()) {
                        warn!(camera = %task.device_id(), error = %e, "post-processing failed");
                    }
                    CaptureOutcome::Completed
                }
                Some(WaitOutcome::TimedOut) => {
                    warn!(camera = %task.device_id(), ?budget, "capture timed out, cancelling");
                    task.cancel().await;
                    CaptureOutcome::TimedOut
                }
                Some(WaitOutcome::Failed(reason)) => {
                    warn!(camera = %task.device_id(), %reason, "capture failed");
                    CaptureOutcome::Failed(reason)
                }
            };
            results.push(result_of(task.as_ref(), outcome));
        }
        false
    }
}

fn result_of(task: &dyn CaptureTask, outcome: CaptureOutcome) -> CaptureResult {
    CaptureResult {
        device: task.device_id().to_string(),
        path: task.output_path().to_path_buf(),
        outcome,
    }
}

/// Cancel tasks without waiting for them to finish.
async fn cancel_all(launched: Vec<Launched>, results: &mut Vec<CaptureResult>) {
    for Launched { mut task, .. } in launched {
        task.cancel().await;
        results.push(result_of(task.as_ref(), CaptureOutcome::Abandoned));
    }
}
