//! Polar alignment measurements and their append-only log.
//!
//! Locating the pole and the rotation centre in a frame is image analysis
//! done elsewhere; it plugs in through [`AlignmentAnalyzer`].  This module
//! only combines the two centres and persists one line per test:
//!
//! ```text
//! 20170227T030405,1520,1010.5,1498.25,1003,21.75,7.5
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pocs_types::PocsError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifacts::FLAT_TIME_FORMAT;

/// A position on the sensor, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelCoord {
    pub x: f64,
    pub y: f64,
}

impl PixelCoord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Finds the reference points of a polar alignment test.
pub trait AlignmentAnalyzer: Send + Sync {
    /// Centre of the celestial pole in the frame taken at home.
    fn pole_center(&self, frame: &Path) -> Result<PixelCoord, PocsError>;

    /// Centre of the star trails in a rotation frame.
    fn rotation_center(&self, frame: &Path) -> Result<PixelCoord, PocsError>;
}

/// Result of one polar alignment test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentMeasurement {
    pub timestamp: DateTime<Utc>,
    pub pole: PixelCoord,
    pub rotate: PixelCoord,
}

impl AlignmentMeasurement {
    /// Offset of the pole from the rotation centre.
    pub fn delta(&self) -> PixelCoord {
        PixelCoord {
            x: self.pole.x - self.rotate.x,
            y: self.pole.y - self.rotate.y,
        }
    }

    /// `timestamp,pole_x,pole_y,rotate_x,rotate_y,delta_x,delta_y`
    pub fn to_log_line(&self) -> String {
        let d = self.delta();
        format!(
            "{},{},{},{},{},{},{}",
            self.timestamp.format(FLAT_TIME_FORMAT),
            self.pole.x,
            self.pole.y,
            self.rotate.x,
            self.rotate.y,
            d.x,
            d.y
        )
    }
}

/// Append-only text log of alignment measurements.
#[derive(Debug, Clone)]
pub struct AlignmentLog {
    path: PathBuf,
}

impl AlignmentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, creating the file and its directory if needed.
    pub fn append(&self, measurement: &AlignmentMeasurement) -> Result<(), PocsError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", measurement.to_log_line())?;
        let delta = measurement.delta();
        info!(
            log = %self.path.display(),
            delta_x = delta.x,
            delta_y = delta.y,
            "alignment measurement recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn measurement() -> AlignmentMeasurement {
        AlignmentMeasurement {
            timestamp: Utc.with_ymd_and_hms(2017, 2, 27, 3, 4, 5).unwrap(),
            pole: PixelCoord::new(1520.0, 1010.5),
            rotate: PixelCoord::new(1498.25, 1003.0),
        }
    }

    #[test]
    fn delta_is_pole_minus_rotation() {
        assert_eq!(measurement().delta(), PixelCoord::new(21.75, 7.5));
    }

    #[test]
    fn log_line_format() {
        assert_eq!(
            measurement().to_log_line(),
            "20170227T030405,1520,1010.5,1498.25,1003,21.75,7.5"
        );
    }

    #[test]
    fn append_creates_file_and_keeps_previous_lines() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let log = AlignmentLog::new(dir.path().join("logs/polar_alignment.txt"));
        log.append(&measurement())?;
        log.append(&measurement())?;

        let text = std::fs::read_to_string(log.path())?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], lines[1]);
        Ok(())
    }
}
