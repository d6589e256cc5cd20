//! Capture artifacts: deterministic output paths and best-effort
//! post-processing.
//!
//! Paths have the shape
//! `{base}/{session_start:%Y%m%dT%H%M%S}/{device}/{label}_{seq:03}.{ext}`,
//! where `seq` counts captures per device from zero.  Given the same session
//! start and the same sequence of requests, the same paths come out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pocs_types::PocsError;
use tracing::debug;

/// Default artifact extension (raw DSLR frames).
pub const DEFAULT_EXTENSION: &str = "cr2";

/// Timestamp layout used for session directories and log lines.
pub const FLAT_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Allocates output paths for one capture run.
#[derive(Debug, Clone)]
pub struct ArtifactNamer {
    base_dir: PathBuf,
    session_start: DateTime<Utc>,
    extension: String,
    sequence: HashMap<String, u32>,
}

impl ArtifactNamer {
    pub fn new(base_dir: impl Into<PathBuf>, session_start: DateTime<Utc>) -> Self {
        Self {
            base_dir: base_dir.into(),
            session_start,
            extension: DEFAULT_EXTENSION.to_string(),
            sequence: HashMap::new(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    /// Directory holding every artifact of this run.
    pub fn session_dir(&self) -> PathBuf {
        self.base_dir
            .join(self.session_start.format(FLAT_TIME_FORMAT).to_string())
    }

    /// Path for the next capture of `device`, advancing its sequence.
    pub fn next_path(&mut self, device: &str, label: &str) -> PathBuf {
        let path = self.peek_path(device, label);
        *self.sequence.entry(device.to_string()).or_insert(0) += 1;
        path
    }

    /// Path the next capture of `device` would get.
    pub fn peek_path(&self, device: &str, label: &str) -> PathBuf {
        let seq = self.sequence.get(device).copied().unwrap_or(0);
        self.session_dir()
            .join(device)
            .join(format!("{label}_{seq:03}.{}", self.extension))
    }

    /// Namer for a run starting at `session_start`.
    ///
    /// Runs started within the same second share a directory, so in that
    /// case the sequences carry on from `self` instead of restarting.
    pub fn successor(&self, session_start: DateTime<Utc>) -> Self {
        let mut next = Self {
            base_dir: self.base_dir.clone(),
            session_start,
            extension: self.extension.clone(),
            sequence: HashMap::new(),
        };
        if next.session_dir() == self.session_dir() {
            next.sequence = self.sequence.clone();
        }
        next
    }
}

/// Post-processing applied to every completed capture.
///
/// Failures are reported to the caller, which logs them and carries on; a
/// processor must never be the reason a batch fails.
pub trait ArtifactProcessor: Send + Sync {
    fn process(&self, device: &str, path: &Path) -> Result<(), PocsError>;
}

/// Checks that the artifact exists and is non-empty, then points a
/// `latest` symlink in the device directory at it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValidateArtifact;

impl ArtifactProcessor for ValidateArtifact {
    fn process(&self, device: &str, path: &Path) -> Result<(), PocsError> {
        let meta = std::fs::metadata(path).map_err(|e| {
            PocsError::Processing(format!("{device}: {}: {e}", path.display()))
        })?;
        if meta.len() == 0 {
            return Err(PocsError::Processing(format!(
                "{device}: {} is empty",
                path.display()
            )));
        }
        refresh_latest(path)?;
        debug!(device, path = %path.display(), bytes = meta.len(), "artifact validated");
        Ok(())
    }
}

#[cfg(unix)]
fn refresh_latest(path: &Path) -> Result<(), PocsError> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let link = dir.join("latest");
    if std::fs::symlink_metadata(&link).is_ok() {
        std::fs::remove_file(&link)
            .map_err(|e| PocsError::Processing(format!("remove {}: {e}", link.display())))?;
    }
    std::os::unix::fs::symlink(name, &link)
        .map_err(|e| PocsError::Processing(format!("link {}: {e}", link.display())))
}

#[cfg(not(unix))]
fn refresh_latest(_path: &Path) -> Result<(), PocsError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 2, 27, 3, 4, 5).unwrap()
    }

    #[test]
    fn paths_are_deterministic_and_sequenced_per_device() {
        let mut namer = ArtifactNamer::new("/data/images", start());
        assert_eq!(
            namer.next_path("cam00", "pole"),
            PathBuf::from("/data/images/20170227T030405/cam00/pole_000.cr2")
        );
        assert_eq!(
            namer.next_path("cam01", "pole"),
            PathBuf::from("/data/images/20170227T030405/cam01/pole_000.cr2")
        );
        assert_eq!(
            namer.next_path("cam00", "rotation_east"),
            PathBuf::from("/data/images/20170227T030405/cam00/rotation_east_001.cr2")
        );

        let mut again = ArtifactNamer::new("/data/images", start());
        assert_eq!(
            again.next_path("cam00", "pole"),
            PathBuf::from("/data/images/20170227T030405/cam00/pole_000.cr2")
        );
    }

    #[test]
    fn successor_in_same_second_continues_sequence() {
        let mut first = ArtifactNamer::new("/data/images", start());
        first.next_path("cam00", "pole");
        first.next_path("cam00", "rotation_east");

        let same_second = start() + chrono::Duration::milliseconds(400);
        let mut second = first.successor(same_second);
        assert_eq!(
            second.peek_path("cam00", "pole"),
            PathBuf::from("/data/images/20170227T030405/cam00/pole_002.cr2")
        );
        assert_eq!(
            second.next_path("cam00", "pole"),
            PathBuf::from("/data/images/20170227T030405/cam00/pole_002.cr2")
        );
        assert_eq!(
            second.next_path("cam01", "pole"),
            PathBuf::from("/data/images/20170227T030405/cam01/pole_000.cr2")
        );

        let later = start() + chrono::Duration::seconds(90);
        let mut third = second.successor(later);
        assert_eq!(
            third.next_path("cam00", "pole"),
            PathBuf::from("/data/images/20170227T030535/cam00/pole_000.cr2")
        );
    }

    #[test]
    fn extension_is_configurable() {
        let mut namer = ArtifactNamer::new("/x", start()).with_extension("fits");
        assert!(namer.next_path("cam00", "flat").ends_with("cam00/flat_000.fits"));
    }

    #[test]
    fn validate_rejects_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.cr2");
        assert!(matches!(
            ValidateArtifact.process("cam00", &missing),
            Err(PocsError::Processing(_))
        ));

        let empty = dir.path().join("empty.cr2");
        std::fs::write(&empty, b"").unwrap();
        assert!(ValidateArtifact.process("cam00", &empty).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn validate_moves_latest_link() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("pole_000.cr2");
        let second = dir.path().join("pole_001.cr2");
        std::fs::write(&first, b"frame").unwrap();
        std::fs::write(&second, b"frame").unwrap();

        ValidateArtifact.process("cam00", &first).unwrap();
        ValidateArtifact.process("cam00", &second).unwrap();
        let target = std::fs::read_link(dir.path().join("latest")).unwrap();
        assert_eq!(target, PathBuf::from("pole_001.cr2"));
    }
}
