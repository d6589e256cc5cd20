//! Generic `Controller` trait – the externally owned observatory controller.
//!
//! The controller's own state machine, scheduler, and weather logic live
//! elsewhere.  The console only asks it the questions below.

use pocs_types::{PocsError, StatusRecord};

use crate::observatory::Observatory;

/// Handle to the observatory controller process.
pub trait Controller: Send + Sync {
    /// Connect to and initialize the hardware.
    fn initialize(&mut self) -> Result<(), PocsError>;

    fn observatory(&self) -> &Observatory;

    fn observatory_mut(&mut self) -> &mut Observatory;

    /// Combined safety verdict (weather, limits, darkness, free space).
    fn is_safe(&self) -> bool;

    fn is_weather_safe(&self) -> bool;

    /// Current structured status.
    fn status(&self) -> StatusRecord;

    /// Park and disconnect every device.
    fn power_down(&mut self) -> Result<(), PocsError>;
}
