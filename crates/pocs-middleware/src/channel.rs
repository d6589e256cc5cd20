//! Message Channel – publisher and subscriber endpoints.
//!
//! Both ends connect to a [`Forwarder`][crate::relay::Forwarder] over
//! WebSocket.  Every frame is one JSON-encoded [`Message`] envelope; the relay
//! forwards frames verbatim, so the envelope is only interpreted here.
//!
//! A [`Subscriber`] receives every message published on its route after it
//! connected.  There is no server-side filtering and no replay: the caller
//! reads what it wants and drops the rest.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use pocs_types::{Message, PocsError};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Payload of the ping a relay sends once a subscriber is attached to its
/// fan-out.
pub(crate) const READY_PAYLOAD: &[u8] = b"pocs-ready";

/// How long [`Subscriber::connect`] waits for the relay's ready signal.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

async fn open(host: &str, port: u16) -> Result<WsStream, PocsError> {
    let url = format!("ws://{host}:{port}");
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| PocsError::Channel(format!("connect to {url}: {e}")))?;
    Ok(stream)
}

/// Wrap a bare string payload as `{"message": <string>}`.
fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::String(s) => json!({ "message": s }),
        other => other,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Publisher
// ────────────────────────────────────────────────────────────────────────────

/// Sending end of a channel, connected to a relay's inbound port.
pub struct Publisher {
    port: u16,
    stream: WsStream,
}

impl Publisher {
    /// Connect to the relay inbound port at `host:port`.
    ///
    /// # Errors
    ///
    /// [`PocsError::Channel`] when the relay is not reachable.
    pub async fn connect(host: &str, port: u16) -> Result<Self, PocsError> {
        let stream = open(host, port).await?;
        debug!(port, "publisher connected");
        Ok(Self { port, stream })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Publish `payload` on `topic`.
    pub async fn send_message(&mut self, topic: &str, payload: Value) -> Result<(), PocsError> {
        let message = Message::new(topic, normalize_payload(payload));
        self.send(&message).await
    }

    /// Publish an already-built envelope.
    pub async fn send(&mut self, message: &Message) -> Result<(), PocsError> {
        let frame = message.to_frame()?;
        self.stream
            .send(Frame::Text(frame.into()))
            .await
            .map_err(|e| PocsError::Channel(format!("publish on port {}: {e}", self.port)))
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(port = self.port, error = %e, "publisher close");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Subscriber
// ────────────────────────────────────────────────────────────────────────────

/// Receiving end of a channel, connected to a relay's outbound port.
pub struct Subscriber {
    port: u16,
    stream: WsStream,
    pending: VecDeque<Message>,
    closed: bool,
}

impl Subscriber {
    /// Connect to the relay outbound port at `host:port`.
    ///
    /// Returns once the relay has attached this subscriber to its fan-out, so
    /// any message published after this call returns will be delivered.
    ///
    /// # Errors
    ///
    /// [`PocsError::Channel`] when the relay is unreachable or never confirms
    /// the subscription.
    pub async fn connect(host: &str, port: u16) -> Result<Self, PocsError> {
        let mut stream = open(host, port).await?;
        let ready = tokio::time::timeout(READY_TIMEOUT, async {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Frame::Ping(payload)) if payload.as_ref() == READY_PAYLOAD => return true,
                    Ok(Frame::Close(_)) | Err(_) => return false,
                    Ok(_) => {}
                }
            }
            false
        })
        .await;
        if !matches!(ready, Ok(true)) {
            return Err(PocsError::Channel(format!(
                "relay on port {port} did not confirm the subscription"
            )));
        }
        debug!(port, "subscriber attached");
        Ok(Self {
            port,
            stream,
            pending: VecDeque::new(),
            closed: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `true` once the relay side has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed && self.pending.is_empty()
    }

    /// Wait at most `wait` for a message to become readable.
    ///
    /// Cancel-safe.
    ///
    /// # Errors
    ///
    /// [`PocsError::Channel`] once the connection is closed and nothing is
    /// left to read.
    pub async fn poll(&mut self, wait: Duration) -> Result<bool, PocsError> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        if self.closed {
            return Err(self.closed_error());
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => return Ok(false),
                Ok(frame) => {
                    self.accept(frame);
                    if !self.pending.is_empty() {
                        return Ok(true);
                    }
                    if self.closed {
                        return Err(self.closed_error());
                    }
                }
            }
        }
    }

    /// Take the next message without waiting.  `None` means nothing is
    /// ready right now.
    pub fn try_receive(&mut self) -> Option<Message> {
        while self.pending.is_empty() && !self.closed {
            match self.stream.next().now_or_never() {
                Some(frame) => self.accept(frame),
                None => break,
            }
        }
        self.pending.pop_front()
    }

    /// Wait at most `wait` for the next message.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<Message>, PocsError> {
        if self.poll(wait).await? {
            Ok(self.try_receive())
        } else {
            Ok(None)
        }
    }

    fn accept(&mut self, frame: Option<Result<Frame, tokio_tungstenite::tungstenite::Error>>) {
        match frame {
            Some(Ok(Frame::Text(text))) => match Message::from_frame(text.as_str()) {
                Ok(message) => self.pending.push_back(message),
                Err(e) => warn!(port = self.port, error = %e, "dropping undecodable frame"),
            },
            Some(Ok(Frame::Close(_))) | None => {
                self.closed = true;
            }
            Some(Err(e)) => {
                warn!(port = self.port, error = %e, "subscriber connection failed");
                self.closed = true;
            }
            Some(Ok(_)) => {}
        }
    }

    fn closed_error(&self) -> PocsError {
        PocsError::Channel(format!("subscriber on port {} is closed", self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_string_payload_is_wrapped() {
        assert_eq!(
            normalize_payload(json!("park")),
            json!({ "message": "park" })
        );
        let structured = json!({ "message": "home", "extra": 1 });
        assert_eq!(normalize_payload(structured.clone()), structured);
    }

    #[tokio::test]
    async fn connect_to_nothing_is_a_channel_error() {
        // Bind then drop to get a port that is very likely closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(matches!(
            Publisher::connect("127.0.0.1", port).await,
            Err(PocsError::Channel(_))
        ));
        assert!(matches!(
            Subscriber::connect("127.0.0.1", port).await,
            Err(PocsError::Channel(_))
        ));
    }
}
