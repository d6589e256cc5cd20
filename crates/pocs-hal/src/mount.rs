//! Generic `Mount` trait for the telescope mount.
//!
//! The mount only exposes boolean motion state, never a completion signal, so
//! callers that need to know when a slew has finished must poll
//! [`Mount::is_slewing`].

use std::time::Duration;

use pocs_types::{Coord, Direction, MountStatus, PocsError};

/// A telescope mount owned by the controller.
pub trait Mount: Send + Sync {
    /// Start a slew to the home position.  Returns once the command is
    /// accepted, not once the mount arrives.
    fn slew_to_home(&mut self) -> Result<(), PocsError>;

    /// Start a slew to `target`.
    fn slew_to_target(&mut self, target: &Coord) -> Result<(), PocsError>;

    /// Guide the mount in `direction` for `duration`.
    fn move_direction(&mut self, direction: Direction, duration: Duration)
    -> Result<(), PocsError>;

    /// Park the mount.
    fn park(&mut self) -> Result<(), PocsError>;

    /// Release the mount from its park position.
    fn unpark(&mut self) -> Result<(), PocsError>;

    fn is_parked(&self) -> bool;

    fn is_slewing(&self) -> bool;

    fn is_home(&self) -> bool;

    /// Snapshot of the three state flags.
    fn status(&self) -> MountStatus {
        MountStatus {
            parked: self.is_parked(),
            slewing: self.is_slewing(),
            home: self.is_home(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockMount {
        parked: bool,
        home: bool,
    }

    impl Mount for MockMount {
        fn slew_to_home(&mut self) -> Result<(), PocsError> {
            self.home = true;
            Ok(())
        }
        fn slew_to_target(&mut self, _target: &Coord) -> Result<(), PocsError> {
            self.home = false;
            Ok(())
        }
        fn move_direction(&mut self, _d: Direction, _t: Duration) -> Result<(), PocsError> {
            self.home = false;
            Ok(())
        }
        fn park(&mut self) -> Result<(), PocsError> {
            self.parked = true;
            Ok(())
        }
        fn unpark(&mut self) -> Result<(), PocsError> {
            self.parked = false;
            Ok(())
        }
        fn is_parked(&self) -> bool {
            self.parked
        }
        fn is_slewing(&self) -> bool {
            false
        }
        fn is_home(&self) -> bool {
            self.home
        }
    }

    #[test]
    fn default_status_reflects_flags() {
        let mut mount = MockMount {
            parked: true,
            home: false,
        };
        assert_eq!(
            mount.status(),
            MountStatus {
                parked: true,
                slewing: false,
                home: false
            }
        );

        mount.unpark().unwrap();
        mount.slew_to_home().unwrap();
        let status = mount.status();
        assert!(!status.parked);
        assert!(status.home);
    }
}
