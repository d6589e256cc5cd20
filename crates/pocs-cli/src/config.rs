//! Console configuration – reads/writes `~/.pocs/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use pocs_middleware::TwitterCredentials;
use pocs_types::{MessagingPorts, RelayRoute};

/// One camera attached to the observatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,

    #[serde(default)]
    pub primary: bool,

    /// Capture command template (`{seconds}`, `{filename}`).  Empty means a
    /// simulated camera.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

/// `[twitter]` section: OAuth 1.0a keys of the account `/social` posts as.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TwitterConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,

    /// Prefix tweets with their timestamp.
    #[serde(default)]
    pub timestamp: bool,
}

impl TwitterConfig {
    pub fn credentials(&self) -> TwitterCredentials {
        TwitterCredentials {
            consumer_key: self.consumer_key.clone(),
            consumer_secret: self.consumer_secret.clone(),
            access_token: self.access_token.clone(),
            access_token_secret: self.access_token_secret.clone(),
        }
    }
}

impl std::fmt::Debug for TwitterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwitterConfig")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("access_token", &self.access_token)
            .field("access_token_secret", &"<redacted>")
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Persisted console configuration stored in `~/.pocs/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host the console's own endpoints connect to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Remote UIs publish commands here.
    #[serde(default = "default_cmd_pub_port")]
    pub cmd_pub_port: u16,

    /// The console reads commands here.
    #[serde(default = "default_cmd_sub_port")]
    pub cmd_sub_port: u16,

    /// The console publishes shell output and status here.
    #[serde(default = "default_status_pub_port")]
    pub status_pub_port: u16,

    /// Remote UIs read status here.
    #[serde(default = "default_status_sub_port")]
    pub status_sub_port: u16,

    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    #[serde(default = "default_alignment_log")]
    pub alignment_log: PathBuf,

    /// Slack incoming webhook for `/social`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub slack_webhook: String,

    /// Prefix Slack posts with their timestamp.
    #[serde(default)]
    pub slack_timestamp: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<TwitterConfig>,

    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraConfig>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("cmd_pub_port", &self.cmd_pub_port)
            .field("cmd_sub_port", &self.cmd_sub_port)
            .field("status_pub_port", &self.status_pub_port)
            .field("status_sub_port", &self.status_sub_port)
            .field("images_dir", &self.images_dir)
            .field("alignment_log", &self.alignment_log)
            .field(
                "slack_webhook",
                if self.slack_webhook.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("slack_timestamp", &self.slack_timestamp)
            .field("twitter", &self.twitter)
            .field("cameras", &self.cameras)
            .finish()
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_cmd_pub_port() -> u16 {
    6500
}
fn default_cmd_sub_port() -> u16 {
    6501
}
fn default_status_pub_port() -> u16 {
    6510
}
fn default_status_sub_port() -> u16 {
    6511
}
fn default_images_dir() -> PathBuf {
    PathBuf::from("/var/panoptes/images")
}
fn default_alignment_log() -> PathBuf {
    PathBuf::from("/var/panoptes/logs/polar_alignment.txt")
}
fn default_cameras() -> Vec<CameraConfig> {
    vec![
        CameraConfig {
            id: "cam00".to_string(),
            primary: true,
            command: Vec::new(),
        },
        CameraConfig {
            id: "cam01".to_string(),
            primary: false,
            command: Vec::new(),
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            cmd_pub_port: default_cmd_pub_port(),
            cmd_sub_port: default_cmd_sub_port(),
            status_pub_port: default_status_pub_port(),
            status_sub_port: default_status_sub_port(),
            images_dir: default_images_dir(),
            alignment_log: default_alignment_log(),
            slack_webhook: String::new(),
            slack_timestamp: false,
            twitter: None,
            cameras: default_cameras(),
        }
    }
}

impl Config {
    pub fn ports(&self) -> MessagingPorts {
        MessagingPorts {
            command: RelayRoute::new(self.cmd_pub_port, self.cmd_sub_port),
            status: RelayRoute::new(self.status_pub_port, self.status_sub_port),
        }
    }

    /// Ports must be distinct and every camera id unique.
    pub fn validate(&self) -> Result<(), String> {
        self.ports().validate().map_err(|e| e.to_string())?;
        for (i, camera) in self.cameras.iter().enumerate() {
            if self.cameras[..i].iter().any(|c| c.id == camera.id) {
                return Err(format!("camera id '{}' is configured more than once", camera.id));
            }
        }
        Ok(())
    }
}

/// Return the path to `~/.pocs/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pocs").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let Some(mut cfg) = load_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Load the config from a specific path, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `POCS_*` environment variable overrides to `cfg`.  Values that do
/// not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `POCS_HOST` | `host` |
/// | `POCS_CMD_PUB_PORT` | `cmd_pub_port` |
/// | `POCS_CMD_SUB_PORT` | `cmd_sub_port` |
/// | `POCS_STATUS_PUB_PORT` | `status_pub_port` |
/// | `POCS_STATUS_SUB_PORT` | `status_sub_port` |
/// | `POCS_IMAGES_DIR` | `images_dir` |
/// | `POCS_SLACK_WEBHOOK` | `slack_webhook` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("POCS_HOST") {
        cfg.host = v;
    }
    for (var, field) in [
        ("POCS_CMD_PUB_PORT", &mut cfg.cmd_pub_port),
        ("POCS_CMD_SUB_PORT", &mut cfg.cmd_sub_port),
        ("POCS_STATUS_PUB_PORT", &mut cfg.status_pub_port),
        ("POCS_STATUS_SUB_PORT", &mut cfg.status_sub_port),
    ] {
        if let Some(port) = std::env::var(var).ok().and_then(|v| v.parse::<u16>().ok()) {
            *field = port;
        }
    }
    if let Ok(v) = std::env::var("POCS_IMAGES_DIR") {
        cfg.images_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("POCS_SLACK_WEBHOOK") {
        cfg.slack_webhook = v;
    }
}

/// Save the config to disk, creating `~/.pocs/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Write the file with owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
