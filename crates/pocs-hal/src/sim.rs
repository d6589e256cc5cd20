//! Simulated devices for headless runs and tests.
//!
//! Every simulator hands out a cloneable *probe* that shares its state, so a
//! test can box the device into an [`Observatory`], give the observatory
//! away, and still inspect what happened or inject faults afterwards.
//!
//! # Example
//!
//! ```rust
//! use pocs_hal::sim::{SimCamera, SimMount, SimObservatory};
//!
//! let mount = SimMount::new().with_slew_polls(2);
//! let probe = mount.probe();
//! let observatory = SimObservatory::new()
//!     .with_mount(mount)
//!     .with_camera(SimCamera::new("cam00").primary())
//!     .build();
//! assert_eq!(observatory.camera_ids(), vec!["cam00"]);
//! assert_eq!(probe.park_calls(), 0);
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use pocs_types::{Coord, Direction, MountStatus, PocsError, StatusRecord};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::camera::Camera;
use crate::controller::Controller;
use crate::dome::Dome;
use crate::mount::Mount;
use crate::observatory::Observatory;
use crate::task::{CaptureTask, EventTask};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Mount
// ────────────────────────────────────────────────────────────────────────────

/// A command received by a [`SimMount`].
#[derive(Debug, Clone, PartialEq)]
pub enum SimMountCommand {
    Home,
    Target(Coord),
    Move(Direction, Duration),
    Park,
    Unpark,
}

#[derive(Debug, Default)]
struct MountState {
    parked: bool,
    home: bool,
    slew_polls: u32,
    remaining: u32,
    stuck: bool,
    failing: bool,
    park_calls: usize,
    log: Vec<SimMountCommand>,
}

impl MountState {
    fn accept(&mut self, command: SimMountCommand) -> Result<(), PocsError> {
        if self.failing {
            return Err(PocsError::Mount(format!("{command:?} rejected by simulator")));
        }
        self.log.push(command);
        Ok(())
    }

    fn start_slew(&mut self, home: bool) {
        self.remaining = self.slew_polls;
        self.home = home;
    }
}

/// A mount whose slews finish after a fixed number of `is_slewing` polls.
///
/// Starts unparked and at home.
pub struct SimMount {
    state: Arc<Mutex<MountState>>,
}

impl Default for SimMount {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMount {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MountState {
                home: true,
                ..MountState::default()
            })),
        }
    }

    /// Number of `is_slewing` polls that report `true` after each motion
    /// command.
    pub fn with_slew_polls(self, polls: u32) -> Self {
        lock(&self.state).slew_polls = polls;
        self
    }

    /// Start in the park position.
    pub fn parked(self) -> Self {
        {
            let mut s = lock(&self.state);
            s.parked = true;
            s.home = false;
        }
        self
    }

    pub fn probe(&self) -> SimMountProbe {
        SimMountProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Mount for SimMount {
    fn slew_to_home(&mut self) -> Result<(), PocsError> {
        let mut s = lock(&self.state);
        s.accept(SimMountCommand::Home)?;
        if s.parked {
            return Err(PocsError::Mount("cannot slew while parked".to_string()));
        }
        s.start_slew(true);
        Ok(())
    }

    fn slew_to_target(&mut self, target: &Coord) -> Result<(), PocsError> {
        let mut s = lock(&self.state);
        s.accept(SimMountCommand::Target(*target))?;
        if s.parked {
            return Err(PocsError::Mount("cannot slew while parked".to_string()));
        }
        s.start_slew(false);
        Ok(())
    }

    fn move_direction(
        &mut self,
        direction: Direction,
        duration: Duration,
    ) -> Result<(), PocsError> {
        let mut s = lock(&self.state);
        s.accept(SimMountCommand::Move(direction, duration))?;
        if s.parked {
            return Err(PocsError::Mount("cannot move while parked".to_string()));
        }
        s.start_slew(false);
        Ok(())
    }

    fn park(&mut self) -> Result<(), PocsError> {
        let mut s = lock(&self.state);
        s.park_calls += 1;
        s.accept(SimMountCommand::Park)?;
        s.parked = true;
        s.home = false;
        s.remaining = 0;
        debug!("sim mount parked");
        Ok(())
    }

    fn unpark(&mut self) -> Result<(), PocsError> {
        let mut s = lock(&self.state);
        s.accept(SimMountCommand::Unpark)?;
        s.parked = false;
        Ok(())
    }

    fn is_parked(&self) -> bool {
        lock(&self.state).parked
    }

    fn is_slewing(&self) -> bool {
        let mut s = lock(&self.state);
        if s.stuck {
            return true;
        }
        if s.remaining > 0 {
            s.remaining -= 1;
            return true;
        }
        false
    }

    fn is_home(&self) -> bool {
        lock(&self.state).home
    }

    /// Reads the flags without spending a slew poll.
    fn status(&self) -> MountStatus {
        let s = lock(&self.state);
        MountStatus {
            parked: s.parked,
            slewing: s.stuck || s.remaining > 0,
            home: s.home,
        }
    }
}

/// Shared view of a [`SimMount`].
#[derive(Clone)]
pub struct SimMountProbe {
    state: Arc<Mutex<MountState>>,
}

impl SimMountProbe {
    /// Accepted commands in arrival order.
    pub fn commands(&self) -> Vec<SimMountCommand> {
        lock(&self.state).log.clone()
    }

    /// Number of park requests, accepted or not.
    pub fn park_calls(&self) -> usize {
        lock(&self.state).park_calls
    }

    pub fn is_parked(&self) -> bool {
        lock(&self.state).parked
    }

    /// When set, `is_slewing` never clears.
    pub fn set_stuck(&self, stuck: bool) {
        lock(&self.state).stuck = stuck;
    }

    /// When set, every motion command is rejected.
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera
// ────────────────────────────────────────────────────────────────────────────

/// How a [`SimCamera`] behaves when asked for an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimCaptureMode {
    /// Sleep for the exposure, write the artifact, complete.
    #[default]
    Normal,
    /// Never complete; only stops when aborted.
    Hung,
    /// Refuse to launch.
    Broken,
}

/// One exposure launched by a [`SimCamera`].
#[derive(Debug, Clone)]
pub struct SimLaunch {
    pub output: PathBuf,
    pub exposure: Duration,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct CameraLog {
    launches: Vec<SimLaunch>,
    completions: usize,
    aborts: usize,
}

/// A camera that fakes exposures with a background task.
///
/// Must be used from inside a tokio runtime.  Under a paused clock the
/// exposure time is simulated, so a 30 s frame costs nothing in a test.
pub struct SimCamera {
    id: String,
    primary: bool,
    mode: SimCaptureMode,
    capture_time: Option<Duration>,
    log: Arc<Mutex<CameraLog>>,
}

impl SimCamera {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            primary: false,
            mode: SimCaptureMode::Normal,
            capture_time: None,
            log: Arc::default(),
        }
    }

    /// Flag this camera as the primary.
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn with_mode(mut self, mode: SimCaptureMode) -> Self {
        self.mode = mode;
        self
    }

    /// Take `capture_time` per frame regardless of the requested exposure.
    pub fn with_capture_time(mut self, capture_time: Duration) -> Self {
        self.capture_time = Some(capture_time);
        self
    }

    pub fn probe(&self) -> SimCameraProbe {
        SimCameraProbe {
            log: Arc::clone(&self.log),
        }
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn take_exposure(
        &mut self,
        exposure: Duration,
        output: &Path,
    ) -> Result<Box<dyn CaptureTask>, PocsError> {
        if self.mode == SimCaptureMode::Broken {
            return Err(PocsError::CaptureLaunch {
                device: self.id.clone(),
                reason: "simulated camera is broken".to_string(),
            });
        }
        lock(&self.log).launches.push(SimLaunch {
            output: output.to_path_buf(),
            exposure,
            at: Instant::now(),
        });

        let (task, flag) = EventTask::new(self.id.clone(), output);
        let duration = self.capture_time.unwrap_or(exposure);
        let hung = self.mode == SimCaptureMode::Hung;
        let path = output.to_path_buf();
        let log = Arc::clone(&self.log);
        let id = self.id.clone();
        tokio::spawn(async move {
            let abort = flag.abort_token().clone();
            let finished = async {
                if hung {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(duration).await;
            };
            tokio::select! {
                () = abort.cancelled() => {
                    debug!(camera = %id, "sim exposure aborted");
                    lock(&log).aborts += 1;
                }
                () = finished => {
                    let written = path
                        .parent()
                        .map_or(Ok(()), std::fs::create_dir_all)
                        .and_then(|()| std::fs::write(&path, format!("sim frame from {id}\n")));
                    match written {
                        Ok(()) => flag.complete(),
                        Err(e) => flag.fail(e.to_string()),
                    }
                    lock(&log).completions += 1;
                }
            }
        });
        info!(camera = %self.id, ?exposure, output = %output.display(), "sim exposure started");
        Ok(Box::new(task))
    }
}

/// Shared view of a [`SimCamera`].
#[derive(Clone)]
pub struct SimCameraProbe {
    log: Arc<Mutex<CameraLog>>,
}

impl SimCameraProbe {
    pub fn launches(&self) -> Vec<SimLaunch> {
        lock(&self.log).launches.clone()
    }

    pub fn completions(&self) -> usize {
        lock(&self.log).completions
    }

    /// Exposures whose producer observed an abort.
    pub fn aborts(&self) -> usize {
        lock(&self.log).aborts
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dome
// ────────────────────────────────────────────────────────────────────────────

/// A dome that opens and closes instantly.
#[derive(Debug, Default)]
pub struct SimDome {
    open: bool,
}

impl SimDome {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dome for SimDome {
    fn open(&mut self) -> Result<(), PocsError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PocsError> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Controller
// ────────────────────────────────────────────────────────────────────────────

/// Flags shared between a [`SimController`] and the test driving it.
#[derive(Debug, Clone)]
pub struct SimControllerHandle {
    safe: Arc<AtomicBool>,
    weather_safe: Arc<AtomicBool>,
    fail_initialize: Arc<AtomicBool>,
    powered_down: Arc<AtomicBool>,
}

impl SimControllerHandle {
    pub fn set_safe(&self, safe: bool) {
        self.safe.store(safe, Ordering::SeqCst);
    }

    pub fn set_weather_safe(&self, safe: bool) {
        self.weather_safe.store(safe, Ordering::SeqCst);
    }

    /// Make the next `initialize` calls fail.
    pub fn set_fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    pub fn is_powered_down(&self) -> bool {
        self.powered_down.load(Ordering::SeqCst)
    }
}

/// A controller around simulated devices.  Safe and weather-safe until told
/// otherwise through its [`SimControllerHandle`].
pub struct SimController {
    observatory: Observatory,
    initialized: bool,
    handle: SimControllerHandle,
}

impl SimController {
    pub fn new(observatory: Observatory) -> Self {
        Self {
            observatory,
            initialized: false,
            handle: SimControllerHandle {
                safe: Arc::new(AtomicBool::new(true)),
                weather_safe: Arc::new(AtomicBool::new(true)),
                fail_initialize: Arc::new(AtomicBool::new(false)),
                powered_down: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn handle(&self) -> SimControllerHandle {
        self.handle.clone()
    }
}

impl Controller for SimController {
    fn initialize(&mut self) -> Result<(), PocsError> {
        if self.handle.fail_initialize.load(Ordering::SeqCst) {
            return Err(PocsError::DeviceUnavailable {
                device: "controller".to_string(),
                reason: "simulated initialization failure".to_string(),
            });
        }
        self.initialized = true;
        info!(cameras = self.observatory.cameras().len(), "sim controller initialized");
        Ok(())
    }

    fn observatory(&self) -> &Observatory {
        &self.observatory
    }

    fn observatory_mut(&mut self) -> &mut Observatory {
        &mut self.observatory
    }

    fn is_safe(&self) -> bool {
        self.handle.safe.load(Ordering::SeqCst) && self.is_weather_safe()
    }

    fn is_weather_safe(&self) -> bool {
        self.handle.weather_safe.load(Ordering::SeqCst)
    }

    fn status(&self) -> StatusRecord {
        let mount = self.observatory.mount().status();
        let state = if self.handle.is_powered_down() {
            "powered_down"
        } else if !self.initialized {
            "uninitialized"
        } else if mount.parked {
            "parked"
        } else {
            "ready"
        };
        StatusRecord {
            state: state.to_string(),
            is_safe: self.is_safe(),
            is_weather_safe: self.is_weather_safe(),
            mount,
            cameras: self.observatory.camera_ids(),
            timestamp: Utc::now(),
        }
    }

    fn power_down(&mut self) -> Result<(), PocsError> {
        let mount = self.observatory.mount_mut();
        if !mount.is_parked() {
            mount.park()?;
        }
        self.initialized = false;
        self.handle.powered_down.store(true, Ordering::SeqCst);
        info!("sim controller powered down");
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for an [`Observatory`] made of simulated devices.
#[derive(Default)]
pub struct SimObservatory {
    mount: Option<SimMount>,
    cameras: Vec<Box<dyn Camera>>,
    dome: bool,
}

impl SimObservatory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `mount` instead of a default [`SimMount`].
    pub fn with_mount(mut self, mount: SimMount) -> Self {
        self.mount = Some(mount);
        self
    }

    pub fn with_camera(mut self, camera: SimCamera) -> Self {
        self.cameras.push(Box::new(camera));
        self
    }

    /// Register any camera driver, simulated or not.
    pub fn with_camera_driver(mut self, camera: Box<dyn Camera>) -> Self {
        self.cameras.push(camera);
        self
    }

    pub fn with_dome(mut self) -> Self {
        self.dome = true;
        self
    }

    pub fn build(self) -> Observatory {
        let mut observatory = Observatory::new(Box::new(self.mount.unwrap_or_default()));
        for camera in self.cameras {
            observatory.register_camera(camera);
        }
        if self.dome {
            observatory.set_dome(Box::new(SimDome::new()));
        }
        observatory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::WaitOutcome;

    #[test]
    fn mount_slew_clears_after_configured_polls() {
        let mut mount = SimMount::new().with_slew_polls(2);
        mount.slew_to_target(&Coord { ra_deg: 10.0, dec_deg: 20.0 }).unwrap();
        assert!(!mount.is_home());
        assert!(mount.is_slewing());
        assert!(mount.is_slewing());
        assert!(!mount.is_slewing());

        mount.slew_to_home().unwrap();
        assert!(mount.is_home());
    }

    #[test]
    fn status_query_does_not_spend_slew_polls() {
        let mut mount = SimMount::new().with_slew_polls(1);
        mount.slew_to_home().unwrap();
        for _ in 0..3 {
            assert!(mount.status().slewing);
        }
        assert!(mount.is_slewing());
        assert!(!mount.status().slewing);
        assert!(!mount.is_slewing());
    }

    #[test]
    fn mount_probe_sees_commands_and_injects_faults() {
        let mut mount = SimMount::new();
        let probe = mount.probe();
        mount.move_direction(Direction::East, Duration::from_secs(3)).unwrap();
        mount.park().unwrap();
        assert!(probe.is_parked());
        assert_eq!(probe.park_calls(), 1);
        assert_eq!(
            probe.commands(),
            vec![
                SimMountCommand::Move(Direction::East, Duration::from_secs(3)),
                SimMountCommand::Park,
            ]
        );

        assert!(mount.slew_to_home().is_err(), "parked mount must not slew");
        mount.unpark().unwrap();

        probe.set_stuck(true);
        assert!(mount.is_slewing());
        probe.set_failing(true);
        assert!(matches!(mount.unpark(), Err(PocsError::Mount(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn camera_writes_frame_after_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("cam00").join("frame_000.cr2");
        let mut cam = SimCamera::new("cam00");
        let probe = cam.probe();

        let mut task = cam.take_exposure(Duration::from_secs(30), &output).unwrap();
        assert_eq!(task.wait(Duration::from_secs(10)).await, WaitOutcome::TimedOut);
        assert_eq!(task.wait(Duration::from_secs(25)).await, WaitOutcome::Completed);
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
        assert_eq!(probe.launches().len(), 1);
        assert_eq!(probe.completions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_camera_stops_only_on_cancel() {
        let mut cam = SimCamera::new("cam01").with_mode(SimCaptureMode::Hung);
        let probe = cam.probe();
        let mut task = cam
            .take_exposure(Duration::from_secs(1), Path::new("/nonexistent/x.cr2"))
            .unwrap();
        assert_eq!(task.wait(Duration::from_secs(60)).await, WaitOutcome::TimedOut);

        task.cancel().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(probe.aborts(), 1);
        assert_eq!(probe.completions(), 0);
    }

    #[test]
    fn broken_camera_refuses_to_launch() {
        let mut cam = SimCamera::new("cam02").with_mode(SimCaptureMode::Broken);
        assert!(matches!(
            cam.take_exposure(Duration::from_secs(1), Path::new("/tmp/x")),
            Err(PocsError::CaptureLaunch { .. })
        ));
        assert!(cam.probe().launches().is_empty());
    }

    #[test]
    fn controller_status_and_power_down() {
        let observatory = SimObservatory::new()
            .with_camera(SimCamera::new("cam00").primary())
            .with_camera(SimCamera::new("cam01"))
            .build();
        let mut controller = SimController::new(observatory);
        let handle = controller.handle();
        assert_eq!(controller.status().state, "uninitialized");

        controller.initialize().unwrap();
        let status = controller.status();
        assert_eq!(status.state, "ready");
        assert_eq!(status.cameras, vec!["cam00", "cam01"]);
        assert!(status.is_safe);

        handle.set_weather_safe(false);
        assert!(!controller.is_safe());

        controller.power_down().unwrap();
        assert!(handle.is_powered_down());
        assert!(controller.observatory().mount().is_parked());
        assert_eq!(controller.status().state, "powered_down");
    }

    #[test]
    fn controller_initialize_can_fail() {
        let mut controller = SimController::new(SimObservatory::new().build());
        controller.handle().set_fail_initialize(true);
        assert!(matches!(
            controller.initialize(),
            Err(PocsError::DeviceUnavailable { .. })
        ));
    }
}
