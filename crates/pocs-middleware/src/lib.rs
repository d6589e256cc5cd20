//! `pocs-middleware` – Messaging
//!
//! Moves commands and status between the console, the controller, and remote
//! UIs without caring what the messages mean.
//!
//! # Modules
//!
//! - [`channel`] – [`Publisher`][channel::Publisher] and
//!   [`Subscriber`][channel::Subscriber]: WebSocket endpoints carrying one
//!   JSON [`Message`][pocs_types::Message] per frame.
//! - [`relay`] – [`Forwarder`][relay::Forwarder] and [`Relay`][relay::Relay]:
//!   the stateless fan-out between publisher ports and subscriber ports.
//! - [`listener`] – [`CommandListener`][listener::CommandListener]: the
//!   polling loop that dispatches remote commands through a fixed
//!   [`CommandTable`][listener::CommandTable].
//! - [`social`] – [`StatusSink`][social::StatusSink] and
//!   [`run_status_forwarder`][social::run_status_forwarder]: announcements to
//!   chat services.

pub mod channel;
pub mod listener;
pub mod relay;
pub mod social;

pub use channel::{Publisher, Subscriber};
pub use listener::{
    CommandListener, CommandSink, CommandTable, ListenEnd, ListenReport, ListenerHandle,
    ListenerState,
};
pub use relay::{Forwarder, ForwarderHandle, Relay, RelayChannel};
pub use social::{SlackSink, StatusSink, TwitterCredentials, TwitterSink, run_status_forwarder};
