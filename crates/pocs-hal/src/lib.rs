//! `pocs-hal` – Capability Proxy
//!
//! The narrow set of operations the console may invoke on hardware owned by
//! the observatory controller.  Nothing here drives a device directly; each
//! trait is the seam a real driver (or a simulator) plugs into.
//!
//! # Modules
//!
//! - [`mount`] – [`Mount`][mount::Mount]: slews, timed guide moves, park state.
//! - [`camera`] – [`Camera`][camera::Camera]: launches exposures and
//!   returns an awaitable [`CaptureTask`][task::CaptureTask].
//! - [`task`] – the awaitable capture task and its two variants,
//!   [`ProcessTask`][task::ProcessTask] and [`EventTask`][task::EventTask].
//! - [`process_camera`] – [`ProcessCamera`][process_camera::ProcessCamera]:
//!   a camera whose exposures are external commands.
//! - [`dome`] – [`Dome`][dome::Dome].
//! - [`observatory`] – [`Observatory`][observatory::Observatory]: the
//!   mount, cameras, and optional dome of one site.
//! - [`controller`] – [`Controller`][controller::Controller]: safety and
//!   status queries delegated to the controller process.
//! - [`sim`] – simulated devices for headless runs and tests.

pub mod camera;
pub mod controller;
pub mod dome;
pub mod mount;
pub mod observatory;
pub mod process_camera;
pub mod sim;
pub mod task;

pub use camera::{Camera, Observation};
pub use controller::Controller;
pub use dome::Dome;
pub use mount::Mount;
pub use observatory::Observatory;
pub use process_camera::ProcessCamera;
pub use sim::{SimCamera, SimController, SimMount, SimObservatory};
pub use task::{CaptureTask, CompletionFlag, EventTask, ProcessTask, WaitOutcome};
