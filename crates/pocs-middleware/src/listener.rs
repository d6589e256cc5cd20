//! Command Listener – turns messages on the command channel into local calls.
//!
//! ```text
//!            listen()
//!   Idle ───────────────▶ Listening
//!    ▲                        │
//!    └── stop / interrupt ────┘
//! ```
//!
//! Each iteration polls the subscriber with a bounded wait, takes at most one
//! message, looks `payload.message` up in the [`CommandTable`] and awaits the
//! bound command on the [`CommandSink`], then sleeps for `idle_sleep`.  Unknown
//! names are dropped silently: the relay has no acknowledgment path back to
//! the sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pocs_types::{COMMAND_TOPIC, Message, PocsError, RemoteCommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Subscriber;

/// Default bounded wait for each poll of the command subscriber.
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(500);
/// Default pause after every loop iteration.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(100);

// ────────────────────────────────────────────────────────────────────────────
// Command table
// ────────────────────────────────────────────────────────────────────────────

/// Fixed mapping from remote command name to command value.
#[derive(Debug, Clone)]
pub struct CommandTable<C> {
    entries: HashMap<String, C>,
}

impl<C> Default for CommandTable<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<C> CommandTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `command`, replacing any earlier binding.
    pub fn with(mut self, name: impl Into<String>, command: C) -> Self {
        self.entries.insert(name.into(), command);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&C> {
        self.entries.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C, S: Into<String>> FromIterator<(S, C)> for CommandTable<C> {
    fn from_iter<I: IntoIterator<Item = (S, C)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Executes the commands a listener looks up.
#[async_trait]
pub trait CommandSink: Send {
    type Command: Send + Sync;

    /// Run `command` to completion.  Long-running commands should stop early
    /// when `interrupt` is cancelled.
    async fn dispatch(
        &mut self,
        command: &Self::Command,
        interrupt: &CancellationToken,
    ) -> Result<(), PocsError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Listener
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
}

/// Why a listen loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenEnd {
    Interrupted,
    Stopped,
    ChannelClosed,
}

/// Counters for one run of [`CommandListener::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenReport {
    pub dispatched: usize,
    /// Command messages whose name was unknown or whose payload had no name.
    pub ignored: usize,
    pub failed: usize,
    pub ended: ListenEnd,
}

/// Cloneable handle for observing and stopping a listener from elsewhere.
#[derive(Debug, Clone, Default)]
pub struct ListenerHandle {
    listening: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl ListenerHandle {
    /// Ask the loop to return at its next iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> ListenerState {
        if self.listening.load(Ordering::SeqCst) {
            ListenerState::Listening
        } else {
            ListenerState::Idle
        }
    }
}

/// Polling loop over one command subscriber.
pub struct CommandListener {
    topic: String,
    poll_wait: Duration,
    idle_sleep: Duration,
    handle: ListenerHandle,
}

impl Default for CommandListener {
    fn default() -> Self {
        Self::new(COMMAND_TOPIC)
    }
}

impl CommandListener {
    /// A listener for `topic` with the default timings.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            poll_wait: DEFAULT_POLL_WAIT,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            handle: ListenerHandle::default(),
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ListenerState {
        self.handle.state()
    }

    pub fn stop_handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Listen until stopped, interrupted, or the channel closes.
    ///
    /// The subscriber is left open in every case.
    pub async fn listen<S: CommandSink>(
        &mut self,
        subscriber: &mut Subscriber,
        table: &CommandTable<S::Command>,
        sink: &mut S,
        interrupt: &CancellationToken,
    ) -> ListenReport {
        self.handle.stop.store(false, Ordering::SeqCst);
        self.handle.listening.store(true, Ordering::SeqCst);
        info!(topic = %self.topic, commands = ?table.names(), "listening for remote commands");

        let mut report = ListenReport {
            dispatched: 0,
            ignored: 0,
            failed: 0,
            ended: ListenEnd::Stopped,
        };
        report.ended = loop {
            if interrupt.is_cancelled() {
                break ListenEnd::Interrupted;
            }
            if self.handle.stop.load(Ordering::SeqCst) {
                break ListenEnd::Stopped;
            }

            let ready = tokio::select! {
                () = interrupt.cancelled() => break ListenEnd::Interrupted,
                ready = subscriber.poll(self.poll_wait) => ready,
            };
            match ready {
                Ok(true) => {
                    if let Some(message) = subscriber.try_receive() {
                        self.handle_message(message, table, sink, interrupt, &mut report)
                            .await;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "command channel closed");
                    break ListenEnd::ChannelClosed;
                }
            }

            tokio::select! {
                () = interrupt.cancelled() => break ListenEnd::Interrupted,
                () = tokio::time::sleep(self.idle_sleep) => {}
            }
        };

        self.handle.listening.store(false, Ordering::SeqCst);
        info!(
            dispatched = report.dispatched,
            ignored = report.ignored,
            failed = report.failed,
            ended = ?report.ended,
            "stopped listening"
        );
        report
    }

    async fn handle_message<S: CommandSink>(
        &self,
        message: Message,
        table: &CommandTable<S::Command>,
        sink: &mut S,
        interrupt: &CancellationToken,
        report: &mut ListenReport,
    ) {
        if message.topic != self.topic {
            return;
        }
        let name = match message.decode_payload::<RemoteCommand>() {
            Ok(command) => command.message,
            Err(e) => {
                debug!(error = %e, "command without a name");
                report.ignored += 1;
                return;
            }
        };
        let Some(command) = table.lookup(&name) else {
            debug!(command = %name, "unknown remote command");
            report.ignored += 1;
            return;
        };
        info!(command = %name, "dispatching remote command");
        match sink.dispatch(command, interrupt).await {
            Ok(()) => report.dispatched += 1,
            Err(e) => {
                warn!(command = %name, error = %e, "remote command failed");
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use pocs_types::RelayRoute;
    use serde_json::json;

    use super::*;
    use crate::channel::Publisher;
    use crate::relay::{Forwarder, ForwarderHandle};

    const HOST: &str = "127.0.0.1";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestCommand {
        Park,
        Explode,
        Stop,
    }

    #[derive(Default)]
    struct Recorder {
        ran: Vec<TestCommand>,
        stop: Option<ListenerHandle>,
    }

    #[async_trait]
    impl CommandSink for Recorder {
        type Command = TestCommand;

        async fn dispatch(
            &mut self,
            command: &TestCommand,
            _interrupt: &CancellationToken,
        ) -> Result<(), PocsError> {
            self.ran.push(*command);
            match command {
                TestCommand::Explode => Err(PocsError::Mount("boom".into())),
                TestCommand::Stop => {
                    if let Some(handle) = &self.stop {
                        handle.stop();
                    }
                    Ok(())
                }
                TestCommand::Park => Ok(()),
            }
        }
    }

    fn table() -> CommandTable<TestCommand> {
        CommandTable::new()
            .with("park", TestCommand::Park)
            .with("explode", TestCommand::Explode)
            .with("stop", TestCommand::Stop)
    }

    async fn relay() -> ForwarderHandle {
        Forwarder::bind_on("cmd", IpAddr::V4(Ipv4Addr::LOCALHOST), RelayRoute::new(0, 0))
            .await
            .unwrap()
            .spawn()
    }

    fn fast_listener() -> CommandListener {
        CommandListener::default()
            .with_poll_wait(Duration::from_millis(50))
            .with_idle_sleep(Duration::from_millis(5))
    }

    #[test]
    fn table_lookup_and_names() {
        let t = table();
        assert_eq!(t.lookup("park"), Some(&TestCommand::Park));
        assert_eq!(t.lookup("unpark"), None);
        assert_eq!(t.names(), vec!["explode", "park", "stop"]);
        assert_eq!(t.len(), 3);

        let collected: CommandTable<u8> = [("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(collected.lookup("b"), Some(&2));
    }

    #[tokio::test]
    async fn unknown_and_failing_commands_do_not_stop_the_loop()
    -> Result<(), Box<dyn std::error::Error>> {
        let relay = relay().await;
        let route = relay.route();
        let mut sub = Subscriber::connect(HOST, route.outbound_port).await?;
        let mut publisher = Publisher::connect(HOST, route.inbound_port).await?;

        let mut listener = fast_listener();
        let mut sink = Recorder {
            stop: Some(listener.stop_handle()),
            ..Recorder::default()
        };

        publisher.send_message(COMMAND_TOPIC, json!("self_destruct")).await?;
        publisher.send_message(COMMAND_TOPIC, json!({ "no_name": true })).await?;
        publisher.send_message("POCS-SHELL", json!("park")).await?;
        publisher.send_message(COMMAND_TOPIC, json!("explode")).await?;
        publisher.send_message(COMMAND_TOPIC, json!({ "message": "park", "x": 1 })).await?;
        publisher.send_message(COMMAND_TOPIC, json!("stop")).await?;

        let interrupt = CancellationToken::new();
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            listener.listen(&mut sub, &table(), &mut sink, &interrupt),
        )
        .await?;

        assert_eq!(
            sink.ran,
            vec![TestCommand::Explode, TestCommand::Park, TestCommand::Stop]
        );
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.ignored, 2);
        assert_eq!(report.ended, ListenEnd::Stopped);
        assert_eq!(listener.state(), ListenerState::Idle);
        assert!(!sub.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn interrupt_returns_to_idle() -> Result<(), Box<dyn std::error::Error>> {
        let relay = relay().await;
        let mut sub = Subscriber::connect(HOST, relay.route().outbound_port).await?;
        let mut listener = fast_listener();
        let handle = listener.stop_handle();
        let interrupt = CancellationToken::new();

        let canceller = interrupt.clone();
        let watcher = tokio::spawn(async move {
            while handle.state() != ListenerState::Listening {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            canceller.cancel();
        });

        let mut sink = Recorder::default();
        let report = listener.listen(&mut sub, &table(), &mut sink, &interrupt).await;
        watcher.await?;
        assert_eq!(report.ended, ListenEnd::Interrupted);
        assert_eq!(report.dispatched, 0);
        assert_eq!(listener.state(), ListenerState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn closed_channel_ends_the_loop() -> Result<(), Box<dyn std::error::Error>> {
        let relay = relay().await;
        let mut sub = Subscriber::connect(HOST, relay.route().outbound_port).await?;
        relay.shutdown().await;

        let mut listener = fast_listener();
        let report = listener
            .listen(&mut sub, &table(), &mut Recorder::default(), &CancellationToken::new())
            .await;
        assert_eq!(report.ended, ListenEnd::ChannelClosed);
        Ok(())
    }
}
