//! `pocs-runtime` – Capture Orchestration and Session
//!
//! Drives the mount and cameras through supervised capture sweeps and ties
//! the controller, the relay, and the command listener together into one
//! explicit session.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`CaptureOrchestrator`][orchestrator::CaptureOrchestrator]:
//!   moves the mount, launches one exposure per camera, and resolves every
//!   launched [`CaptureTask`][pocs_hal::CaptureTask] with a bounded wait
//!   before the next phase.  Operator interruption cancels in-flight
//!   captures and stops the sweep; the mount always gets a best-effort
//!   return home.
//! - [`artifacts`] – [`ArtifactNamer`][artifacts::ArtifactNamer]:
//!   deterministic per-device output paths, and the best-effort
//!   [`ArtifactProcessor`][artifacts::ArtifactProcessor] run on every
//!   completed frame.
//! - [`alignment`] – polar alignment measurements and their append-only log.
//! - [`session`] – [`Session`][session::Session]: controller lifecycle,
//!   messaging, the safety gate policy, and the remote command table.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod alignment;
pub mod artifacts;
pub mod orchestrator;
pub mod session;
pub mod telemetry;

pub use alignment::{AlignmentAnalyzer, AlignmentLog, AlignmentMeasurement, PixelCoord};
pub use artifacts::{ArtifactNamer, ArtifactProcessor, ValidateArtifact};
pub use orchestrator::{
    AlignmentSettings, BatchReport, CaptureOrchestrator, CaptureOutcome, CaptureResult, MountMove,
    MountWait, OrchestratorConfig, Phase, PhaseReport, SweepPlan, SweepReport,
};
pub use session::{PolarAlignmentReport, Session, SessionCommand, SessionConfig, SessionState};
pub use telemetry::{TracerProviderGuard, init_tracing};
