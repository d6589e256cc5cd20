//! Relay – two independent forwarders, one for commands and one for status.
//!
//! A [`Forwarder`] listens on two ports.  Publishers connect to the inbound
//! port, subscribers to the outbound port.  Every frame read from any inbound
//! connection is re-emitted, verbatim and in arrival order, to every outbound
//! connection.  Inbound connections are never written to and outbound
//! connections are never forwarded from, so a route cannot echo.
//!
//! Delivery is best-effort: with no subscriber attached a frame is dropped,
//! and a subscriber that falls more than [`FANOUT_CAPACITY`] frames behind
//! skips the frames it missed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures_util::{SinkExt, StreamExt};
use pocs_types::{MessagingPorts, PocsError, RelayRoute};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::READY_PAYLOAD;

/// Frames buffered per subscriber before it starts lagging.
pub const FANOUT_CAPACITY: usize = 1024;

// ────────────────────────────────────────────────────────────────────────────
// Forwarder
// ────────────────────────────────────────────────────────────────────────────

/// A bound but not yet running forwarder.
pub struct Forwarder {
    name: String,
    route: RelayRoute,
    inbound: TcpListener,
    outbound: TcpListener,
}

impl Forwarder {
    /// Bind both ports of `route` on all interfaces.
    pub async fn bind(name: impl Into<String>, route: RelayRoute) -> Result<Self, PocsError> {
        Self::bind_on(name, IpAddr::V4(Ipv4Addr::UNSPECIFIED), route).await
    }

    /// Bind both ports of `route` on `ip`.
    ///
    /// # Errors
    ///
    /// [`PocsError::Config`] for a route that reuses a port,
    /// [`PocsError::Bind`] when either port cannot be bound.  On failure
    /// nothing stays bound.
    pub async fn bind_on(
        name: impl Into<String>,
        ip: IpAddr,
        route: RelayRoute,
    ) -> Result<Self, PocsError> {
        route.validate()?;
        let inbound = listen(ip, route.inbound_port).await?;
        let outbound = listen(ip, route.outbound_port).await?;
        let route = RelayRoute::new(local_port(&inbound)?, local_port(&outbound)?);
        Ok(Self {
            name: name.into(),
            route,
            inbound,
            outbound,
        })
    }

    /// The bound route, with ephemeral ports resolved.
    pub fn route(&self) -> RelayRoute {
        self.route
    }

    /// Start forwarding in a background task.
    pub fn spawn(self) -> ForwarderHandle {
        let shutdown = CancellationToken::new();
        let name = self.name.clone();
        let route = self.route;
        info!(
            forwarder = %name,
            inbound = route.inbound_port,
            outbound = route.outbound_port,
            "forwarder started"
        );
        let task = tokio::spawn(self.run(shutdown.clone()));
        ForwarderHandle {
            name,
            route,
            shutdown,
            task: Some(task),
        }
    }

    async fn run(self, shutdown: CancellationToken) {
        let (fanout, _) = broadcast::channel::<Frame>(FANOUT_CAPACITY);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.inbound.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_publisher(
                            stream,
                            peer,
                            fanout.clone(),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => error!(forwarder = %self.name, error = %e, "inbound accept error"),
                },
                accepted = self.outbound.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_subscriber(
                            stream,
                            peer,
                            fanout.clone(),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => error!(forwarder = %self.name, error = %e, "outbound accept error"),
                },
            }
        }
        info!(forwarder = %self.name, "forwarder stopped");
    }
}

async fn listen(ip: IpAddr, port: u16) -> Result<TcpListener, PocsError> {
    TcpListener::bind(SocketAddr::new(ip, port))
        .await
        .map_err(|e| PocsError::Bind {
            port,
            reason: e.to_string(),
        })
}

fn local_port(listener: &TcpListener) -> Result<u16, PocsError> {
    Ok(listener.local_addr()?.port())
}

/// Read frames from one publisher into the fan-out.  Never writes back.
async fn handle_publisher(
    stream: TcpStream,
    peer: SocketAddr,
    fanout: broadcast::Sender<Frame>,
    shutdown: CancellationToken,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "publisher handshake failed");
            return;
        }
    };
    debug!(peer = %peer, "publisher attached");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            frame = ws.next() => match frame {
                Some(Ok(frame @ (Frame::Text(_) | Frame::Binary(_)))) => {
                    // No subscribers: the frame is dropped.
                    let _ = fanout.send(frame);
                }
                Some(Ok(Frame::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(peer = %peer, error = %e, "publisher connection error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(peer = %peer, "publisher detached");
}

/// Write every fan-out frame to one subscriber.  Frames it sends are
/// discarded.
async fn handle_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    fanout: broadcast::Sender<Frame>,
    shutdown: CancellationToken,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "subscriber handshake failed");
            return;
        }
    };
    let (mut tx, mut rx) = ws.split();
    let mut frames = fanout.subscribe();
    // Subscribed before the ready signal, so nothing published after the
    // client sees it can be missed.
    if tx.send(Frame::Ping(READY_PAYLOAD.to_vec().into())).await.is_err() {
        return;
    }
    debug!(peer = %peer, "subscriber attached");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = tx.close().await;
                break;
            }
            next = frames.recv() => match next {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(peer = %peer, skipped = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = rx.next() => match incoming {
                Some(Ok(Frame::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(peer = %peer, "subscriber detached");
}

/// A running forwarder.  Dropping the handle stops it.
pub struct ForwarderHandle {
    name: String,
    route: RelayRoute,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ForwarderHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound route, with ephemeral ports resolved.
    pub fn route(&self) -> RelayRoute {
        self.route
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop accepting, close every connection, and wait for the accept loop
    /// to exit.  The ports are released when this returns.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(forwarder = %self.name, error = %e, "forwarder task failed");
            }
        }
    }
}

impl Drop for ForwarderHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Relay
// ────────────────────────────────────────────────────────────────────────────

/// Which of the two relay routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayChannel {
    /// Console and remote UIs to the controller.
    Command,
    /// Controller to console and remote UIs.
    Status,
}

impl RelayChannel {
    pub fn name(self) -> &'static str {
        match self {
            RelayChannel::Command => "command",
            RelayChannel::Status => "status",
        }
    }
}

/// The command and status forwarders of one session.
///
/// Each forwarder is started and fails independently: a port that cannot be
/// bound leaves only that channel unavailable, and calling
/// [`start`][Self::start] again retries it.
pub struct Relay {
    ip: IpAddr,
    ports: MessagingPorts,
    command: Option<ForwarderHandle>,
    status: Option<ForwarderHandle>,
}

impl Relay {
    /// A relay for `ports` on all interfaces.  Nothing is bound yet.
    pub fn new(ports: MessagingPorts) -> Result<Self, PocsError> {
        Self::on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), ports)
    }

    /// A relay for `ports` bound on `ip`.
    pub fn on(ip: IpAddr, ports: MessagingPorts) -> Result<Self, PocsError> {
        ports.validate()?;
        Ok(Self {
            ip,
            ports,
            command: None,
            status: None,
        })
    }

    /// Bind every forwarder that is not already running.
    ///
    /// # Errors
    ///
    /// The first bind failure.  The other forwarder is started regardless.
    pub async fn start(&mut self) -> Result<(), PocsError> {
        let mut first_error = None;
        for channel in [RelayChannel::Command, RelayChannel::Status] {
            if self.is_running(channel) {
                continue;
            }
            let route = match channel {
                RelayChannel::Command => self.ports.command,
                RelayChannel::Status => self.ports.status,
            };
            match Forwarder::bind_on(channel.name(), self.ip, route).await {
                Ok(forwarder) => *self.slot(channel) = Some(forwarder.spawn()),
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "forwarder unavailable");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_running(&self, channel: RelayChannel) -> bool {
        self.handle(channel).is_some_and(ForwarderHandle::is_running)
    }

    /// The bound route of a running forwarder.
    pub fn route(&self, channel: RelayChannel) -> Option<RelayRoute> {
        self.handle(channel).map(ForwarderHandle::route)
    }

    /// Stop both forwarders.
    pub async fn shutdown(&mut self) {
        for channel in [RelayChannel::Command, RelayChannel::Status] {
            if let Some(handle) = self.slot(channel).take() {
                handle.shutdown().await;
            }
        }
    }

    fn handle(&self, channel: RelayChannel) -> Option<&ForwarderHandle> {
        match channel {
            RelayChannel::Command => self.command.as_ref(),
            RelayChannel::Status => self.status.as_ref(),
        }
    }

    fn slot(&mut self, channel: RelayChannel) -> &mut Option<ForwarderHandle> {
        match channel {
            RelayChannel::Command => &mut self.command,
            RelayChannel::Status => &mut self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pocs_types::{Message, STATUS_TOPIC};
    use serde_json::json;

    use super::*;
    use crate::channel::{Publisher, Subscriber};

    const HOST: &str = "127.0.0.1";
    const WAIT: Duration = Duration::from_secs(2);

    async fn loopback_forwarder() -> ForwarderHandle {
        Forwarder::bind_on("test", IpAddr::V4(Ipv4Addr::LOCALHOST), RelayRoute::new(0, 0))
            .await
            .unwrap()
            .spawn()
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message_in_order() -> Result<(), Box<dyn std::error::Error>>
    {
        let relay = loopback_forwarder().await;
        let route = relay.route();
        let mut first = Subscriber::connect(HOST, route.outbound_port).await?;
        let mut second = Subscriber::connect(HOST, route.outbound_port).await?;
        let mut publisher = Publisher::connect(HOST, route.inbound_port).await?;

        for i in 0..5 {
            publisher.send_message("TEST", json!({ "seq": i })).await?;
        }

        for sub in [&mut first, &mut second] {
            for i in 0..5 {
                let msg = sub.receive(WAIT).await?.ok_or("message missing")?;
                assert_eq!(msg.topic, "TEST");
                assert_eq!(msg.payload, json!({ "seq": i }));
            }
        }
        relay.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_history() -> Result<(), Box<dyn std::error::Error>> {
        let relay = loopback_forwarder().await;
        let route = relay.route();
        let mut early = Subscriber::connect(HOST, route.outbound_port).await?;
        let mut publisher = Publisher::connect(HOST, route.inbound_port).await?;

        publisher.send_message("TEST", json!("before")).await?;
        // Once the early subscriber has it, the relay has fanned it out.
        let msg = early.receive(WAIT).await?.ok_or("message missing")?;
        assert_eq!(msg.payload, json!({ "message": "before" }));

        let mut late = Subscriber::connect(HOST, route.outbound_port).await?;
        publisher.send_message("TEST", json!("after")).await?;

        let msg = late.receive(WAIT).await?.ok_or("message missing")?;
        assert_eq!(msg.payload, json!({ "message": "after" }));
        assert!(late.receive(Duration::from_millis(200)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn publisher_never_receives_its_own_messages() -> Result<(), Box<dyn std::error::Error>>
    {
        let relay = loopback_forwarder().await;
        let route = relay.route();
        let mut sub = Subscriber::connect(HOST, route.outbound_port).await?;
        let mut publisher = Publisher::connect(HOST, route.inbound_port).await?;
        publisher.send_message("TEST", json!({ "n": 1 })).await?;
        assert!(sub.receive(WAIT).await?.is_some());

        // A client on the outbound port that publishes is not forwarded.
        let mut rogue = Publisher::connect(HOST, route.outbound_port).await?;
        rogue.send_message("TEST", json!({ "n": 2 })).await?;
        assert!(sub.receive(Duration::from_millis(300)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn status_record_survives_the_relay() -> Result<(), Box<dyn std::error::Error>> {
        let relay = loopback_forwarder().await;
        let route = relay.route();
        let mut sub = Subscriber::connect(HOST, route.outbound_port).await?;
        let mut publisher = Publisher::connect(HOST, route.inbound_port).await?;

        let record = pocs_types::StatusRecord {
            state: "ready".into(),
            is_safe: true,
            is_weather_safe: true,
            mount: pocs_types::MountStatus::default(),
            cameras: vec!["cam00".into()],
            timestamp: chrono::Utc::now(),
        };
        let sent = Message::new(STATUS_TOPIC, serde_json::to_value(&record)?);
        publisher.send(&sent).await?;

        let got = sub.receive(WAIT).await?.ok_or("status missing")?;
        assert_eq!(got, sent);
        assert_eq!(got.decode_payload::<pocs_types::StatusRecord>()?, record);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_subscribers_and_frees_ports() -> Result<(), Box<dyn std::error::Error>>
    {
        let relay = loopback_forwarder().await;
        let route = relay.route();
        let mut sub = Subscriber::connect(HOST, route.outbound_port).await?;
        assert!(relay.is_running());
        relay.shutdown().await;

        assert!(sub.poll(WAIT).await.is_err());
        let again = Forwarder::bind_on("again", IpAddr::V4(Ipv4Addr::LOCALHOST), route).await?;
        assert_eq!(again.route(), route);
        Ok(())
    }

    #[tokio::test]
    async fn busy_port_is_a_bind_error_and_start_retries() -> Result<(), Box<dyn std::error::Error>>
    {
        let blocker = TcpListener::bind("127.0.0.1:0").await?;
        let busy = blocker.local_addr()?.port();

        let ports = MessagingPorts {
            command: RelayRoute::new(busy, 0),
            status: RelayRoute::new(0, 0),
        };
        let mut relay = Relay::on(IpAddr::V4(Ipv4Addr::LOCALHOST), ports)?;
        match relay.start().await {
            Err(PocsError::Bind { port, .. }) => assert_eq!(port, busy),
            other => panic!("expected bind error, got {other:?}"),
        }
        assert!(!relay.is_running(RelayChannel::Command));
        assert!(relay.is_running(RelayChannel::Status));
        let status_route = relay.route(RelayChannel::Status).ok_or("status route")?;

        drop(blocker);
        relay.start().await?;
        assert!(relay.is_running(RelayChannel::Command));
        // The status forwarder was left alone.
        assert_eq!(relay.route(RelayChannel::Status), Some(status_route));

        relay.shutdown().await;
        assert!(!relay.is_running(RelayChannel::Status));
        Ok(())
    }

    #[test]
    fn relay_rejects_duplicate_ports() {
        let ports = MessagingPorts {
            command: RelayRoute::new(6500, 6501),
            status: RelayRoute::new(6500, 6511),
        };
        assert!(matches!(Relay::new(ports), Err(PocsError::Config(_))));
    }
}
