//! Social status sinks – forward announcements from the status channel to
//! chat services.
//!
//! [`run_status_forwarder`] reads one subscriber and hands the `message`
//! field of every message on the chosen topic to each configured
//! [`StatusSink`].  Sinks are fire-and-forget: a failed post is logged and
//! the next message is processed as usual.
//!
//! | Sink | Transport |
//! |---|---|
//! | [`SlackSink`] | incoming webhook, JSON `{"text": …}` |
//! | [`TwitterSink`] | `POST /2/tweets`, OAuth 1.0a user context (HMAC-SHA1) |

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use pocs_types::PocsError;
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde_json::json;
use sha1::Sha1;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Subscriber;

/// Poll wait used by [`run_status_forwarder`].
pub const FORWARDER_POLL_WAIT: Duration = Duration::from_millis(500);

/// A destination for human-readable status announcements.
#[async_trait]
pub trait StatusSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &str, timestamp: DateTime<Utc>) -> Result<(), PocsError>;
}

/// Posts announcements to a Slack incoming webhook.
pub struct SlackSink {
    client: reqwest::Client,
    webhook_url: String,
    output_timestamp: bool,
}

impl SlackSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            output_timestamp: false,
        }
    }

    /// Use a preconfigured HTTP client (proxy, timeouts).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Prefix every post with `"{timestamp} - "`.
    pub fn with_timestamp(mut self, output_timestamp: bool) -> Self {
        self.output_timestamp = output_timestamp;
        self
    }

    fn render(&self, message: &str, timestamp: DateTime<Utc>) -> String {
        stamp(message, timestamp, self.output_timestamp)
    }
}

#[async_trait]
impl StatusSink for SlackSink {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, message: &str, timestamp: DateTime<Utc>) -> Result<(), PocsError> {
        let body = json!({ "text": self.render(message, timestamp) });
        self.client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| PocsError::Channel(format!("slack post: {e}")))?;
        Ok(())
    }
}

/// Tweet endpoint used unless [`TwitterSink::with_endpoint`] overrides it.
pub const TWITTER_ENDPOINT: &str = "https://api.twitter.com/2/tweets";

fn stamp(message: &str, timestamp: DateTime<Utc>, output_timestamp: bool) -> String {
    if output_timestamp {
        format!("{} - {message}", timestamp.format("%Y-%m-%d %H:%M:%S"))
    } else {
        message.to_string()
    }
}

/// App and user keys for OAuth 1.0a.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwitterCredentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

/// Posts announcements as tweets on behalf of the configured account.
pub struct TwitterSink {
    client: reqwest::Client,
    endpoint: String,
    credentials: TwitterCredentials,
    output_timestamp: bool,
}

impl TwitterSink {
    pub fn new(credentials: TwitterCredentials) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: TWITTER_ENDPOINT.to_string(),
            credentials,
            output_timestamp: false,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Prefix every tweet with `"{timestamp} - "`.
    pub fn with_timestamp(mut self, output_timestamp: bool) -> Self {
        self.output_timestamp = output_timestamp;
        self
    }

    /// `Authorization` header for one request.
    ///
    /// `params` are the query or form parameters that take part in the
    /// signature; a JSON body does not.
    pub fn authorization(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        timestamp: i64,
        nonce: &str,
    ) -> Result<String, PocsError> {
        let creds = &self.credentials;
        let timestamp = timestamp.to_string();
        let oauth = [
            ("oauth_consumer_key", creds.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp.as_str()),
            ("oauth_token", creds.access_token.as_str()),
            ("oauth_version", "1.0"),
        ];

        let mut signed: Vec<(String, String)> = oauth
            .iter()
            .chain(params)
            .map(|(k, v)| (percent(k), percent(v)))
            .collect();
        signed.sort();
        let param_string = signed
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let base = format!(
            "{}&{}&{}",
            method.to_ascii_uppercase(),
            percent(url),
            percent(&param_string)
        );
        let key = format!(
            "{}&{}",
            percent(&creds.consumer_secret),
            percent(&creds.access_token_secret)
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())
            .map_err(|e| PocsError::Config(format!("twitter signing key: {e}")))?;
        mac.update(base.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let header = oauth
            .iter()
            .map(|(k, v)| (*k, *v))
            .chain([("oauth_signature", signature.as_str())])
            .map(|(k, v)| format!("{k}=\"{}\"", percent(v)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth {header}"))
    }
}

/// RFC 3986 encoding: everything but unreserved characters.
fn percent(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn nonce() -> Result<String, PocsError> {
    let mut rng = OsRng;
    let mut bytes = [0u8; 24];
    rng.try_fill_bytes(&mut bytes)
        .map_err(|e| PocsError::Channel(format!("twitter nonce: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[async_trait]
impl StatusSink for TwitterSink {
    fn name(&self) -> &str {
        "twitter"
    }

    async fn send(&self, message: &str, timestamp: DateTime<Utc>) -> Result<(), PocsError> {
        let auth = self.authorization("POST", &self.endpoint, &[], Utc::now().timestamp(), &nonce()?)?;
        let body = json!({ "text": stamp(message, timestamp, self.output_timestamp) });
        self.client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| PocsError::Channel(format!("tweet: {e}")))?;
        Ok(())
    }
}

/// Forward every `topic` message to each sink until `interrupt` fires or the
/// subscriber closes.  Returns the number of messages forwarded.
pub async fn run_status_forwarder(
    subscriber: &mut Subscriber,
    topic: &str,
    sinks: &[Box<dyn StatusSink>],
    interrupt: &CancellationToken,
) -> usize {
    let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
    info!(topic, sinks = ?names, "forwarding status to social sinks");
    let mut forwarded = 0;
    loop {
        let ready = tokio::select! {
            () = interrupt.cancelled() => break,
            ready = subscriber.poll(FORWARDER_POLL_WAIT) => ready,
        };
        match ready {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(topic, error = %e, "status channel closed");
                break;
            }
        }
        let Some(message) = subscriber.try_receive() else {
            continue;
        };
        if message.topic != topic {
            continue;
        }
        let Some(text) = message.payload.get("message").and_then(|v| v.as_str()) else {
            debug!(topic, "status announcement without text");
            continue;
        };
        for sink in sinks {
            if let Err(e) = sink.send(text, message.timestamp).await {
                debug!(sink = sink.name(), error = %e, "social post failed");
            }
        }
        forwarded += 1;
    }
    info!(forwarded, "social forwarding stopped");
    forwarded
}
