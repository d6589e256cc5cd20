//! [`Session`] – the console's explicit session context.
//!
//! A session owns everything one console works with: the attached
//! [`Controller`], the [`Relay`], the console's own status publisher and
//! command subscriber, and the [`CommandListener`].  Nothing is global; the
//! CLI creates one session and passes it around.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──attach──▶ Initialized ◀──▶ Running
//!                               │
//!                          power_down
//!                               ▼
//!                           TornDown ──attach──▶ Initialized
//! ```
//!
//! `Running` covers a capture sweep or a listen loop in progress.
//!
//! # Gate policy
//!
//! | Command | Gate |
//! |---|---|
//! | polar alignment, home | [`SafetyGate::motion`] |
//! | unpark | [`SafetyGate::unpark`] |
//! | park | [`SafetyGate::initialized_only`] |
//!
//! A refused command has no side effect.
//!
//! # Messaging wiring
//!
//! The console publishes shell output and status records into the status
//! route's inbound port and reads remote commands from the command route's
//! outbound port.  Remote UIs do the mirror image.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pocs_hal::Controller;
use pocs_kernel::{GateSnapshot, SafetyGate};
use pocs_middleware::{
    CommandListener, CommandSink, CommandTable, ListenEnd, ListenReport, ListenerHandle,
    Publisher, Relay, RelayChannel, Subscriber,
};
use pocs_types::{
    COMMAND_TOPIC, Direction, MessagingPorts, PocsError, RelayRoute, SHELL_TOPIC, STATUS_TOPIC,
    StatusRecord,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alignment::{AlignmentAnalyzer, AlignmentLog, AlignmentMeasurement};
use crate::artifacts::ArtifactNamer;
use crate::orchestrator::{
    AlignmentSettings, CaptureOrchestrator, CaptureOutcome, MountWait, OrchestratorConfig,
    POLE_LABEL, SweepPlan, SweepReport, rotation_label, wait_for_mount,
};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Everything a session needs to know up front.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Host the console's own publisher and subscriber connect to.
    pub host: String,
    /// Interface the relay binds.
    pub bind_ip: IpAddr,
    pub ports: MessagingPorts,
    /// Root of every capture directory.
    pub images_dir: PathBuf,
    pub orchestrator: OrchestratorConfig,
    pub alignment: AlignmentSettings,
    pub alignment_log: PathBuf,
    pub listen_poll_wait: Duration,
    pub listen_idle_sleep: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: MessagingPorts::default(),
            images_dir: PathBuf::from("images"),
            orchestrator: OrchestratorConfig::default(),
            alignment: AlignmentSettings::default(),
            alignment_log: PathBuf::from("logs/polar_alignment.txt"),
            listen_poll_wait: pocs_middleware::listener::DEFAULT_POLL_WAIT,
            listen_idle_sleep: pocs_middleware::listener::DEFAULT_IDLE_SLEEP,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// Commands a remote UI may send on the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Pole frame plus an eastward rotation frame.
    PolarAlignment,
    Park,
    Unpark,
    Home,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Running,
    TornDown,
}

/// Result of [`Session::polar_alignment_test`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolarAlignmentReport {
    pub sweep: SweepReport,
    /// Present when the sweep finished, an analyzer is installed, and the
    /// primary camera produced both frames.
    pub measurement: Option<AlignmentMeasurement>,
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

pub struct Session {
    config: SessionConfig,
    state: SessionState,
    controller: Option<Box<dyn Controller>>,
    relay: Relay,
    publisher: Option<Publisher>,
    commands: Option<Subscriber>,
    listener: CommandListener,
    analyzer: Option<Box<dyn AlignmentAnalyzer>>,
    alignment_log: AlignmentLog,
    /// Namer of the last capture run; later runs continue its sequences.
    namer: Option<ArtifactNamer>,
}

impl Session {
    /// Create a session.  Nothing is attached or bound yet.
    ///
    /// # Errors
    ///
    /// [`PocsError::Config`] when the messaging ports collide.
    pub fn new(config: SessionConfig) -> Result<Self, PocsError> {
        let relay = Relay::on(config.bind_ip, config.ports)?;
        let listener = CommandListener::new(COMMAND_TOPIC)
            .with_poll_wait(config.listen_poll_wait)
            .with_idle_sleep(config.listen_idle_sleep);
        let alignment_log = AlignmentLog::new(&config.alignment_log);
        Ok(Self {
            config,
            state: SessionState::Uninitialized,
            controller: None,
            relay,
            publisher: None,
            commands: None,
            listener,
            analyzer: None,
            alignment_log,
            namer: None,
        })
    }

    /// Install the image analysis used to turn alignment frames into a
    /// measurement.
    pub fn with_analyzer(mut self, analyzer: Box<dyn AlignmentAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn controller(&self) -> Option<&dyn Controller> {
        self.controller.as_deref()
    }

    /// Initialize `controller` and make it the session's controller.
    ///
    /// On failure the previous controller, if any, stays attached.
    pub fn attach(&mut self, mut controller: Box<dyn Controller>) -> Result<(), PocsError> {
        if self.state == SessionState::Running {
            return Err(PocsError::Config(
                "cannot attach a controller while a command is running".to_string(),
            ));
        }
        if let Err(e) = controller.initialize() {
            warn!(error = %e, "controller failed to initialize");
            return Err(e);
        }
        info!(
            cameras = ?controller.observatory().camera_ids(),
            primary = ?controller.observatory().primary_camera_id(),
            "controller attached"
        );
        self.controller = Some(controller);
        self.state = SessionState::Initialized;
        Ok(())
    }

    // ── Messaging ───────────────────────────────────────────────────────────

    /// Start the relay and connect the console's publisher and subscriber.
    ///
    /// Safe to call again: only what is missing is retried.
    ///
    /// # Errors
    ///
    /// The first failure.  Everything that could be started is left running.
    pub async fn start_messaging(&mut self) -> Result<(), PocsError> {
        let mut first_error = self.relay.start().await.err();

        if self.publisher.is_none() {
            if let Some(route) = self.relay.route(RelayChannel::Status) {
                match Publisher::connect(&self.config.host, route.inbound_port).await {
                    Ok(publisher) => self.publisher = Some(publisher),
                    Err(e) => {
                        warn!(error = %e, "status publisher unavailable");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if self.commands.as_ref().is_none_or(Subscriber::is_closed) {
            self.commands = None;
            if let Some(route) = self.relay.route(RelayChannel::Command) {
                match Subscriber::connect(&self.config.host, route.outbound_port).await {
                    Ok(subscriber) => self.commands = Some(subscriber),
                    Err(e) => {
                        warn!(error = %e, "command subscriber unavailable");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    command = ?self.relay.route(RelayChannel::Command),
                    status = ?self.relay.route(RelayChannel::Status),
                    "messaging started"
                );
                Ok(())
            }
        }
    }

    /// Shut the relay down and drop the console's endpoints.
    pub async fn stop_messaging(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            publisher.close().await;
        }
        self.commands = None;
        self.relay.shutdown().await;
    }

    pub fn is_messaging(&self) -> bool {
        self.publisher.is_some()
    }

    /// Bound route of a running relay channel.
    pub fn relay_route(&self, channel: RelayChannel) -> Option<RelayRoute> {
        self.relay.route(channel)
    }

    /// Log `message` and, when messaging is up, publish it on the shell
    /// topic.
    pub async fn say(&mut self, message: &str) {
        info!(target: "pocs::shell", "{message}");
        if self.publisher.is_some() {
            if let Err(e) = self.publish(SHELL_TOPIC, json!(message)).await {
                warn!(error = %e, "shell message not published");
            }
        }
    }

    /// Publish the controller's status record on the status topic.
    pub async fn publish_status(&mut self) -> Result<StatusRecord, PocsError> {
        let record = self
            .controller
            .as_ref()
            .map(|c| c.status())
            .ok_or(PocsError::NotInitialized)?;
        let payload =
            serde_json::to_value(&record).map_err(|e| PocsError::Decode(e.to_string()))?;
        self.publish(STATUS_TOPIC, payload).await?;
        Ok(record)
    }

    /// Send on the console's publisher.  A failed send drops the publisher
    /// until the next [`start_messaging`][Self::start_messaging].
    async fn publish(&mut self, topic: &str, payload: serde_json::Value) -> Result<(), PocsError> {
        let publisher = self
            .publisher
            .as_mut()
            .ok_or_else(|| PocsError::Channel("messaging is not started".to_string()))?;
        let sent = publisher.send_message(topic, payload).await;
        if sent.is_err() {
            self.publisher = None;
        }
        sent
    }

    // ── Commands ────────────────────────────────────────────────────────────

    /// Remote command names and what they run.
    pub fn command_table() -> CommandTable<SessionCommand> {
        CommandTable::new()
            .with("polar_alignment", SessionCommand::PolarAlignment)
            .with("park", SessionCommand::Park)
            .with("unpark", SessionCommand::Unpark)
            .with("home", SessionCommand::Home)
    }

    /// Handle for stopping [`listen`][Self::listen] from another task.
    pub fn listener_handle(&self) -> ListenerHandle {
        self.listener.stop_handle()
    }

    /// Dispatch remote commands until interrupted, stopped, or the command
    /// channel closes.
    ///
    /// # Errors
    ///
    /// [`PocsError::Channel`] when messaging was never started.
    pub async fn listen(&mut self, interrupt: &CancellationToken) -> Result<ListenReport, PocsError> {
        let mut subscriber = self
            .commands
            .take()
            .ok_or_else(|| PocsError::Channel("messaging is not started".to_string()))?;
        let table = Self::command_table();
        let mut listener = std::mem::take(&mut self.listener);
        let previous = self.enter_running();

        let report = listener.listen(&mut subscriber, &table, self, interrupt).await;

        self.listener = listener;
        self.leave_running(previous);
        if report.ended != ListenEnd::ChannelClosed {
            self.commands = Some(subscriber);
        }
        Ok(report)
    }

    /// Park the mount.  Allowed in unsafe conditions.
    pub async fn park(&mut self) -> Result<(), PocsError> {
        SafetyGate::initialized_only().check(&self.snapshot())?;
        self.say("Parking mount").await;
        self.controller_mut()?.observatory_mut().mount_mut().park()
    }

    pub async fn unpark(&mut self) -> Result<(), PocsError> {
        SafetyGate::unpark().check(&self.snapshot())?;
        self.say("Unparking mount").await;
        self.controller_mut()?.observatory_mut().mount_mut().unpark()
    }

    /// Slew home and wait for the mount to settle.
    ///
    /// An interrupt while the mount is moving parks it instead.  A failed
    /// park is logged; the result is still [`MountWait::Interrupted`].
    pub async fn home(&mut self, interrupt: &CancellationToken) -> Result<MountWait, PocsError> {
        SafetyGate::motion().check(&self.snapshot())?;
        self.say("Slewing to home").await;
        let config = self.config.orchestrator;
        let waited = {
            let mount = self.controller_mut()?.observatory_mut().mount_mut();
            mount.slew_to_home()?;
            wait_for_mount(mount, &config, interrupt).await?
        };
        if waited == MountWait::Interrupted {
            self.say("Slew to home interrupted, parking mount").await;
            if let Err(e) = self.controller_mut()?.observatory_mut().mount_mut().park() {
                warn!(error = %e, "safe park after interrupted slew failed");
            }
        }
        Ok(waited)
    }

    /// Take a pole frame at home and one trailed rotation frame per
    /// direction, then measure and log the misalignment.
    ///
    /// # Errors
    ///
    /// Gate refusal, or the mount failure that aborted the sweep.  An
    /// interrupted sweep is reported through [`SweepReport::interrupted`].
    pub async fn polar_alignment_test(
        &mut self,
        directions: &[Direction],
        interrupt: &CancellationToken,
    ) -> Result<PolarAlignmentReport, PocsError> {
        SafetyGate::motion().check(&self.snapshot())?;
        self.say("Starting polar alignment test").await;

        let start = Utc::now();
        let namer = match &self.namer {
            Some(previous) => previous.successor(start),
            None => ArtifactNamer::new(self.config.images_dir.join("polar_alignment"), start),
        };
        let mut orchestrator = CaptureOrchestrator::new(self.config.orchestrator, namer);
        let plan = SweepPlan::polar_alignment(&self.config.alignment, directions);

        let previous = self.enter_running();
        let swept = match self.controller.as_mut() {
            Some(controller) => {
                orchestrator
                    .run_sweep(controller.observatory_mut(), &plan, interrupt)
                    .await
            }
            None => Err(PocsError::NotInitialized),
        };
        self.leave_running(previous);
        self.namer = Some(orchestrator.into_namer());
        let sweep = match swept {
            Ok(sweep) => sweep,
            Err(e) => {
                self.say(&format!("Polar alignment test failed: {e}")).await;
                return Err(e);
            }
        };

        if sweep.interrupted {
            self.say("Polar alignment test interrupted").await;
            return Ok(PolarAlignmentReport {
                sweep,
                measurement: None,
            });
        }

        let measurement = self.measure(&sweep, directions, start);
        if let Some(m) = &measurement {
            if let Err(e) = self.alignment_log.append(m) {
                warn!(error = %e, "alignment log not written");
            }
            let d = m.delta();
            self.say(&format!("Polar alignment offset: dx={:.2} dy={:.2}", d.x, d.y))
                .await;
        }
        self.say("Polar alignment test complete").await;
        Ok(PolarAlignmentReport { sweep, measurement })
    }

    /// Park if possible, power the controller down, and stop messaging.
    ///
    /// Messaging is stopped even when the controller fails to power down.
    pub async fn power_down(&mut self) -> Result<(), PocsError> {
        self.say("Shutting down").await;
        let result = match self.controller.as_mut() {
            Some(controller) => controller.power_down(),
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "controller power down failed");
        }
        self.stop_messaging().await;
        self.state = SessionState::TornDown;
        info!("session torn down");
        result
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn controller_mut(&mut self) -> Result<&mut Box<dyn Controller>, PocsError> {
        self.controller.as_mut().ok_or(PocsError::NotInitialized)
    }

    fn snapshot(&self) -> GateSnapshot {
        let initialized = matches!(
            self.state,
            SessionState::Initialized | SessionState::Running
        );
        match self.controller.as_deref() {
            Some(c) => GateSnapshot {
                initialized,
                parked: c.observatory().mount().is_parked(),
                safe: c.is_safe(),
                weather_safe: c.is_weather_safe(),
            },
            None => GateSnapshot {
                initialized: false,
                parked: false,
                safe: false,
                weather_safe: false,
            },
        }
    }

    fn enter_running(&mut self) -> SessionState {
        std::mem::replace(&mut self.state, SessionState::Running)
    }

    fn leave_running(&mut self, previous: SessionState) {
        if self.state == SessionState::Running {
            self.state = previous;
        }
    }

    /// Analyze the primary camera's pole frame and last rotation frame.
    fn measure(
        &self,
        sweep: &SweepReport,
        directions: &[Direction],
        start: chrono::DateTime<Utc>,
    ) -> Option<AlignmentMeasurement> {
        let analyzer = self.analyzer.as_ref()?;
        let primary = self
            .controller
            .as_deref()
            .and_then(|c| c.observatory().primary_camera_id())?;
        let last = directions.last()?;

        let pole_frame = completed_frame(sweep, POLE_LABEL, primary)?;
        let rotate_frame = completed_frame(sweep, &rotation_label(*last), primary)?;
        let analyzed = analyzer
            .pole_center(pole_frame)
            .and_then(|pole| Ok((pole, analyzer.rotation_center(rotate_frame)?)));
        match analyzed {
            Ok((pole, rotate)) => Some(AlignmentMeasurement {
                timestamp: start,
                pole,
                rotate,
            }),
            Err(e) => {
                warn!(error = %e, "alignment frames could not be analyzed");
                None
            }
        }
    }
}

/// Artifact of `device` in phase `label`, if it completed.
fn completed_frame<'a>(sweep: &'a SweepReport, label: &str, device: &str) -> Option<&'a Path> {
    let result = sweep.phase(label)?.batch.as_ref()?.result_for(device)?;
    (result.outcome == CaptureOutcome::Completed).then_some(result.path.as_path())
}

#[async_trait]
impl CommandSink for Session {
    type Command = SessionCommand;

    async fn dispatch(
        &mut self,
        command: &SessionCommand,
        interrupt: &CancellationToken,
    ) -> Result<(), PocsError> {
        match command {
            SessionCommand::PolarAlignment => self
                .polar_alignment_test(&[Direction::East], interrupt)
                .await
                .map(|_| ()),
            SessionCommand::Park => self.park().await,
            SessionCommand::Unpark => self.unpark().await,
            SessionCommand::Home => self.home(interrupt).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pocs_hal::sim::{SimCamera, SimController, SimControllerHandle, SimMount, SimMountProbe};
    use pocs_hal::SimObservatory;

    use super::*;
    use crate::alignment::PixelCoord;

    fn config(dir: &Path) -> SessionConfig {
        SessionConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: MessagingPorts {
                command: RelayRoute::new(0, 0),
                status: RelayRoute::new(0, 0),
            },
            images_dir: dir.join("images"),
            alignment_log: dir.join("logs/polar_alignment.txt"),
            ..SessionConfig::default()
        }
    }

    fn attached(dir: &Path, mount: SimMount) -> (Session, SimMountProbe, SimControllerHandle) {
        let probe = mount.probe();
        let controller = SimController::new(
            SimObservatory::new()
                .with_mount(mount)
                .with_camera(SimCamera::new("cam00").primary())
                .with_camera(SimCamera::new("cam01"))
                .build(),
        );
        let handle = controller.handle();
        let mut session = Session::new(config(dir)).unwrap();
        session.attach(Box::new(controller)).unwrap();
        (session, probe, handle)
    }

    struct FixedAnalyzer;

    impl AlignmentAnalyzer for FixedAnalyzer {
        fn pole_center(&self, frame: &Path) -> Result<PixelCoord, PocsError> {
            assert!(frame.to_string_lossy().contains("cam00"));
            Ok(PixelCoord::new(100.0, 50.0))
        }

        fn rotation_center(&self, frame: &Path) -> Result<PixelCoord, PocsError> {
            assert!(frame.to_string_lossy().contains("rotation_east"));
            Ok(PixelCoord::new(90.0, 55.0))
        }
    }

    #[test]
    fn colliding_ports_are_rejected() {
        let config = SessionConfig {
            ports: MessagingPorts {
                command: RelayRoute::new(6500, 6501),
                status: RelayRoute::new(6501, 6511),
            },
            ..SessionConfig::default()
        };
        assert!(matches!(Session::new(config), Err(PocsError::Config(_))));
    }

    #[test]
    fn command_table_maps_remote_names() {
        let table = Session::command_table();
        assert_eq!(table.names(), vec!["home", "park", "polar_alignment", "unpark"]);
        assert_eq!(table.lookup("park"), Some(&SessionCommand::Park));
        assert_eq!(table.lookup("dance"), None);
    }

    #[tokio::test]
    async fn commands_are_refused_without_controller() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(config(dir.path())).unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.park().await, Err(PocsError::NotInitialized));
        assert!(session.home(&CancellationToken::new()).await.is_err());
        assert!(session.listen(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn failed_initialize_leaves_session_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SimController::new(SimObservatory::new().build());
        controller.handle().set_fail_initialize(true);
        let mut session = Session::new(config(dir.path())).unwrap();
        assert!(session.attach(Box::new(controller)).is_err());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.controller().is_none());
    }

    #[tokio::test]
    async fn park_is_allowed_in_bad_weather_but_motion_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, probe, handle) = attached(dir.path(), SimMount::new());
        handle.set_weather_safe(false);

        assert!(matches!(
            session.home(&CancellationToken::new()).await,
            Err(PocsError::SafetyGate { .. })
        ));
        assert!(probe.commands().is_empty());

        session.park().await.unwrap();
        assert_eq!(probe.park_calls(), 1);

        assert!(session.unpark().await.is_err());
        handle.set_weather_safe(true);
        session.unpark().await.unwrap();
        assert!(!probe.is_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn polar_alignment_measures_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (session, probe, _) = attached(dir.path(), SimMount::new().with_slew_polls(1));
        let mut session = session.with_analyzer(Box::new(FixedAnalyzer));

        let report = session
            .polar_alignment_test(&[Direction::East], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.sweep.interrupted);
        assert!(report.sweep.returned_home);
        assert_eq!(report.sweep.phases.len(), 2);

        let m = report.measurement.unwrap();
        assert_eq!(m.delta(), PixelCoord::new(10.0, -5.0));
        let log = std::fs::read_to_string(dir.path().join("logs/polar_alignment.txt")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.trim_end().ends_with(",10,-5"));

        assert_eq!(probe.commands().last(), Some(&pocs_hal::sim::SimMountCommand::Home));
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_home_parks_the_mount() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, probe, _) = attached(dir.path(), SimMount::new().with_slew_polls(30));
        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        assert_eq!(session.home(&interrupt).await, Ok(MountWait::Interrupted));
        assert_eq!(
            probe.commands(),
            vec![
                pocs_hal::sim::SimMountCommand::Home,
                pocs_hal::sim::SimMountCommand::Park,
            ]
        );
        assert!(probe.is_parked());

        // An undisturbed slew does not park.
        let (mut session, probe, _) = attached(dir.path(), SimMount::new().with_slew_polls(2));
        assert_eq!(
            session.home(&CancellationToken::new()).await,
            Ok(MountWait::Settled)
        );
        assert_eq!(probe.park_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_alignment_tests_keep_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _, _) = attached(dir.path(), SimMount::new());

        let first = session
            .polar_alignment_test(&[Direction::East], &CancellationToken::new())
            .await
            .unwrap();
        let second = session
            .polar_alignment_test(&[Direction::East], &CancellationToken::new())
            .await
            .unwrap();

        let frames = |report: &PolarAlignmentReport| -> Vec<PathBuf> {
            report
                .sweep
                .phases
                .iter()
                .filter_map(|p| p.batch.as_ref())
                .flat_map(|b| b.results.iter().map(|r| r.path.clone()))
                .collect()
        };
        let mut all = frames(&first);
        all.extend(frames(&second));
        let count = all.len();
        assert_eq!(count, 8);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), count);
    }

    #[tokio::test]
    async fn failed_status_publish_is_retried_by_start_messaging() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _, _) = attached(dir.path(), SimMount::new());
        session.start_messaging().await.unwrap();
        session.publish_status().await.unwrap();

        session.relay.shutdown().await;
        for _ in 0..200 {
            if !session.is_messaging() {
                break;
            }
            let _ = session.publish_status().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!session.is_messaging());
        assert!(matches!(
            session.publish_status().await,
            Err(PocsError::Channel(_))
        ));

        session.start_messaging().await.unwrap();
        assert!(session.is_messaging());
        assert_eq!(session.publish_status().await.unwrap().cameras, vec!["cam00", "cam01"]);
    }

    #[tokio::test]
    async fn power_down_parks_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, probe, handle) = attached(dir.path(), SimMount::new());
        session.start_messaging().await.unwrap();
        assert!(session.is_messaging());

        session.power_down().await.unwrap();
        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(probe.park_calls(), 1);
        assert!(handle.is_powered_down());
        assert!(!session.is_messaging());
        assert!(session.relay_route(RelayChannel::Status).is_none());
        assert!(matches!(
            session.home(&CancellationToken::new()).await,
            Err(PocsError::NotInitialized)
        ));
    }
}
