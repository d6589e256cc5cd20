//! `pocs-kernel` – Safety Gate
//!
//! Nothing moves the mount or opens a shutter without passing through here.
//!
//! # Modules
//!
//! - [`safety_gate`] – [`SafetyGate`][safety_gate::SafetyGate]: a rule
//!   engine that checks a [`GateSnapshot`][safety_gate::GateSnapshot] of the
//!   controller against registered [`SafetyRule`][safety_gate::SafetyRule]s
//!   and refuses the command on the first violation.

pub mod safety_gate;

pub use safety_gate::{
    GateSnapshot, InitializedRule, NotParkedRule, SafeConditionsRule, SafetyGate, SafetyRule,
};
