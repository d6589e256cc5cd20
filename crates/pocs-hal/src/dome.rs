//! Generic `Dome` trait for the enclosure.

use pocs_types::PocsError;

/// The observatory enclosure, when one is installed.
pub trait Dome: Send + Sync {
    fn open(&mut self) -> Result<(), PocsError>;

    fn close(&mut self) -> Result<(), PocsError>;

    fn is_open(&self) -> bool;
}
