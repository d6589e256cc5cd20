//! `pocs-types` – shared data model for the observatory console.
//!
//! Everything that crosses a crate boundary lives here: the wire envelope
//! carried by the message relay, port bindings, the status record published
//! by the controller, and the [`PocsError`] taxonomy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic carrying commands issued by remote UIs.
pub const COMMAND_TOPIC: &str = "PAWS-CMD";
/// Topic carrying free-form operator shell output.
pub const SHELL_TOPIC: &str = "POCS-SHELL";
/// Topic carrying [`StatusRecord`] payloads.
pub const STATUS_TOPIC: &str = "STATUS";
/// Topic carrying human-readable announcements suitable for social sinks.
pub const CHAT_TOPIC: &str = "PANCHAT";

// ────────────────────────────────────────────────────────────────────────────
// Wire envelope
// ────────────────────────────────────────────────────────────────────────────

/// A single `(topic, payload)` message as carried by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, PocsError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| PocsError::Decode(format!("payload on '{}': {e}", self.topic)))
    }

    /// Encode the envelope as a single JSON text frame.
    pub fn to_frame(&self) -> Result<String, PocsError> {
        serde_json::to_string(self).map_err(|e| PocsError::Decode(e.to_string()))
    }

    /// Decode a JSON text frame back into an envelope.
    pub fn from_frame(frame: &str) -> Result<Self, PocsError> {
        serde_json::from_str(frame).map_err(|e| PocsError::Decode(e.to_string()))
    }
}

/// Payload of a message on [`COMMAND_TOPIC`].
///
/// Only `message` is interpreted; additional fields are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub message: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Endpoints and routes
// ────────────────────────────────────────────────────────────────────────────

/// Which side of a channel an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

/// One end of a message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub role: Role,
    pub port: u16,
}

/// A unidirectional forwarding binding: everything published on
/// `inbound_port` is re-emitted to every subscriber on `outbound_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayRoute {
    pub inbound_port: u16,
    pub outbound_port: u16,
}

impl RelayRoute {
    pub fn new(inbound_port: u16, outbound_port: u16) -> Self {
        Self {
            inbound_port,
            outbound_port,
        }
    }

    /// Endpoint that publishers connect to.
    pub fn publisher_endpoint(&self) -> Endpoint {
        Endpoint {
            role: Role::Publisher,
            port: self.inbound_port,
        }
    }

    /// Endpoint that subscribers connect to.
    pub fn subscriber_endpoint(&self) -> Endpoint {
        Endpoint {
            role: Role::Subscriber,
            port: self.outbound_port,
        }
    }

    /// Reject a route whose two sides share a port.  Port `0` (ephemeral)
    /// is allowed on both sides.
    pub fn validate(&self) -> Result<(), PocsError> {
        if self.inbound_port != 0 && self.inbound_port == self.outbound_port {
            return Err(PocsError::Config(format!(
                "relay route uses port {} for both sides",
                self.inbound_port
            )));
        }
        Ok(())
    }
}

/// The two relay routes of a session: commands flow console/UI → controller,
/// status flows controller → console/UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingPorts {
    pub command: RelayRoute,
    pub status: RelayRoute,
}

impl Default for MessagingPorts {
    fn default() -> Self {
        Self {
            command: RelayRoute::new(6500, 6501),
            status: RelayRoute::new(6510, 6511),
        }
    }
}

impl MessagingPorts {
    /// All four ports must be distinct for the life of a session.  Port `0`
    /// asks the OS for an ephemeral port and is exempt.
    pub fn validate(&self) -> Result<(), PocsError> {
        let ports = [
            self.command.inbound_port,
            self.command.outbound_port,
            self.status.inbound_port,
            self.status.outbound_port,
        ];
        for (i, a) in ports.iter().enumerate() {
            for b in &ports[i + 1..] {
                if *a != 0 && a == b {
                    return Err(PocsError::Config(format!(
                        "messaging port {a} is assigned more than once"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Mount vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// Guide direction for a timed mount move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::North => "north",
            Direction::South => "south",
            Direction::East => "east",
            Direction::West => "west",
        };
        f.write_str(name)
    }
}

impl FromStr for Direction {
    type Err = PocsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "north" | "n" => Ok(Direction::North),
            "south" | "s" => Ok(Direction::South),
            "east" | "e" => Ok(Direction::East),
            "west" | "w" => Ok(Direction::West),
            other => Err(PocsError::Config(format!("unknown direction '{other}'"))),
        }
    }
}

/// A slew target.  The console never transforms coordinates; it only hands
/// them to the mount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// Status
// ────────────────────────────────────────────────────────────────────────────

/// Mount flags reported in a [`StatusRecord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountStatus {
    pub parked: bool,
    pub slewing: bool,
    pub home: bool,
}

/// Structured status snapshot published on [`STATUS_TOPIC`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: String,
    pub is_safe: bool,
    pub is_weather_safe: bool,
    pub mount: MountStatus,
    pub cameras: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Every failure the console can report.
///
/// Operator interruption is not listed here; reports carry it as a flag.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PocsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot bind port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Capture launch failed on {device}: {reason}")]
    CaptureLaunch { device: String, reason: String },

    #[error("Mount command failed: {0}")]
    Mount(String),

    #[error("Mount still moving after {waited:?}")]
    MountTimeout { waited: Duration },

    #[error("Safety gate '{rule}' refused: {reason}")]
    SafetyGate { rule: String, reason: String },

    #[error("Controller is not initialized")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Post-processing failed: {0}")]
    Processing(String),
}

impl From<std::io::Error> for PocsError {
    fn from(e: std::io::Error) -> Self {
        PocsError::Io(e.to_string())
    }
}
