//! [`SafetyGate`] – interlock checked before any motion or capture command.
//!
//! The session takes a [`GateSnapshot`] of the controller immediately before
//! issuing a command and passes it through [`SafetyGate::check`].  Every
//! registered [`SafetyRule`] is evaluated in order; the first violation
//! returns [`PocsError::SafetyGate`] (or [`PocsError::NotInitialized`]) and
//! the command is **not** issued.
//!
//! Three built-in rules are provided:
//! - [`InitializedRule`] – the controller has been attached and initialized.
//! - [`NotParkedRule`] – the mount is not parked.
//! - [`SafeConditionsRule`] – the controller reports safe conditions and safe
//!   weather.

use pocs_types::PocsError;
use tracing::warn;

/// Controller state the gate decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSnapshot {
    pub initialized: bool,
    pub parked: bool,
    pub safe: bool,
    pub weather_safe: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single precondition a command must satisfy.
pub trait SafetyRule: Send + Sync {
    /// Human-readable name used in refusal messages.
    fn name(&self) -> &str;

    fn check(&self, snapshot: &GateSnapshot) -> Result<(), PocsError>;
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyGate
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine evaluated before a command reaches the hardware.
///
/// # Example
///
/// ```
/// use pocs_kernel::{GateSnapshot, SafetyGate};
///
/// let gate = SafetyGate::motion();
/// let ready = GateSnapshot { initialized: true, parked: false, safe: true, weather_safe: true };
/// assert!(gate.check(&ready).is_ok());
///
/// let parked = GateSnapshot { parked: true, ..ready };
/// assert!(gate.check(&parked).is_err());
///
/// // Parking stays available in bad weather.
/// let storm = GateSnapshot { safe: false, weather_safe: false, ..ready };
/// assert!(SafetyGate::initialized_only().check(&storm).is_ok());
/// ```
#[derive(Default)]
pub struct SafetyGate {
    rules: Vec<Box<dyn SafetyRule>>,
}

impl SafetyGate {
    /// An empty gate that lets everything through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Full gate for motion and capture: initialized, not parked, safe.
    pub fn motion() -> Self {
        Self::new()
            .with_rule(Box::new(InitializedRule))
            .with_rule(Box::new(NotParkedRule))
            .with_rule(Box::new(SafeConditionsRule))
    }

    /// Gate used for unparking: initialized and safe, parked is expected.
    pub fn unpark() -> Self {
        Self::new()
            .with_rule(Box::new(InitializedRule))
            .with_rule(Box::new(SafeConditionsRule))
    }

    /// Gate used for parking, which must stay available when conditions are
    /// unsafe.
    pub fn initialized_only() -> Self {
        Self::new().with_rule(Box::new(InitializedRule))
    }

    /// Register a rule.  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn SafetyRule>) {
        self.rules.push(rule);
    }

    pub fn with_rule(mut self, rule: Box<dyn SafetyRule>) -> Self {
        self.add_rule(rule);
        self
    }

    /// Names of the registered rules, in evaluation order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Check `snapshot` against every rule.  The refusal is logged at warn.
    pub fn check(&self, snapshot: &GateSnapshot) -> Result<(), PocsError> {
        for rule in &self.rules {
            if let Err(e) = rule.check(snapshot) {
                warn!(rule = rule.name(), error = %e, "safety gate refused command");
                return Err(e);
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Refuses when no controller is attached or it failed to initialize.
pub struct InitializedRule;

impl SafetyRule for InitializedRule {
    fn name(&self) -> &str {
        "initialized"
    }

    fn check(&self, snapshot: &GateSnapshot) -> Result<(), PocsError> {
        if snapshot.initialized {
            Ok(())
        } else {
            Err(PocsError::NotInitialized)
        }
    }
}

/// Refuses while the mount is parked.
pub struct NotParkedRule;

impl SafetyRule for NotParkedRule {
    fn name(&self) -> &str {
        "not_parked"
    }

    fn check(&self, snapshot: &GateSnapshot) -> Result<(), PocsError> {
        if snapshot.parked {
            return Err(PocsError::SafetyGate {
                rule: self.name().to_string(),
                reason: "mount is parked".to_string(),
            });
        }
        Ok(())
    }
}

/// Refuses unless both the overall and the weather safety checks pass.
pub struct SafeConditionsRule;

impl SafetyRule for SafeConditionsRule {
    fn name(&self) -> &str {
        "safe_conditions"
    }

    fn check(&self, snapshot: &GateSnapshot) -> Result<(), PocsError> {
        let reason = match (snapshot.safe, snapshot.weather_safe) {
            (true, true) => return Ok(()),
            (_, false) => "weather is not safe",
            (false, true) => "controller reports unsafe conditions",
        };
        Err(PocsError::SafetyGate {
            rule: self.name().to_string(),
            reason: reason.to_string(),
        })
    }
}
