//! [`Observatory`] – the devices of one site.
//!
//! Holds exactly one [`Mount`], any number of [`Camera`]s keyed by their
//! identifier, and an optional [`Dome`].  Cameras are stored in a
//! `BTreeMap`, so iteration order is the identifier order and stays stable
//! across a capture batch.

use std::collections::BTreeMap;

use pocs_types::PocsError;
use tracing::info;

use crate::camera::Camera;
use crate::dome::Dome;
use crate::mount::Mount;

/// Camera set keyed by camera identifier.
pub type CameraSet = BTreeMap<String, Box<dyn Camera>>;

/// The mount, cameras, and enclosure of one observatory.
pub struct Observatory {
    mount: Box<dyn Mount>,
    cameras: CameraSet,
    dome: Option<Box<dyn Dome>>,
}

impl Observatory {
    /// Create an observatory around `mount` with no cameras and no dome.
    pub fn new(mount: Box<dyn Mount>) -> Self {
        Self {
            mount,
            cameras: BTreeMap::new(),
            dome: None,
        }
    }

    /// Register a camera.  A previously registered camera with the same id
    /// is replaced.
    pub fn register_camera(&mut self, camera: Box<dyn Camera>) {
        self.cameras.insert(camera.id().to_string(), camera);
    }

    /// Install the enclosure.
    pub fn set_dome(&mut self, dome: Box<dyn Dome>) {
        self.dome = Some(dome);
    }

    pub fn mount(&self) -> &dyn Mount {
        self.mount.as_ref()
    }

    pub fn mount_mut(&mut self) -> &mut dyn Mount {
        self.mount.as_mut()
    }

    pub fn cameras(&self) -> &CameraSet {
        &self.cameras
    }

    /// Camera identifiers in iteration order.
    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }

    /// Identifier of the first camera flagged primary, if any.
    pub fn primary_camera_id(&self) -> Option<&str> {
        self.cameras
            .values()
            .find(|c| c.is_primary())
            .map(|c| c.id())
    }

    /// Disjoint mutable access to the mount and the cameras, so a phase can
    /// move the mount and drive the cameras without re-borrowing.
    pub fn split_mut(&mut self) -> (&mut dyn Mount, &mut CameraSet) {
        (self.mount.as_mut(), &mut self.cameras)
    }

    pub fn has_dome(&self) -> bool {
        self.dome.is_some()
    }

    /// Open the dome.
    ///
    /// # Errors
    ///
    /// [`PocsError::DeviceUnavailable`] when no dome is installed.
    pub fn open_dome(&mut self) -> Result<(), PocsError> {
        let dome = self.dome.as_mut().ok_or_else(no_dome)?;
        info!("opening dome");
        dome.open()
    }

    /// Close the dome.
    ///
    /// # Errors
    ///
    /// [`PocsError::DeviceUnavailable`] when no dome is installed.
    pub fn close_dome(&mut self) -> Result<(), PocsError> {
        let dome = self.dome.as_mut().ok_or_else(no_dome)?;
        info!("closing dome");
        dome.close()
    }

    pub fn is_dome_open(&self) -> bool {
        self.dome.as_ref().is_some_and(|d| d.is_open())
    }
}

fn no_dome() -> PocsError {
    PocsError::DeviceUnavailable {
        device: "dome".to_string(),
        reason: "no dome installed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCamera, SimDome, SimMount};

    #[test]
    fn cameras_iterate_in_id_order() {
        let mut obs = Observatory::new(Box::new(SimMount::new()));
        obs.register_camera(Box::new(SimCamera::new("cam02")));
        obs.register_camera(Box::new(SimCamera::new("cam00")));
        obs.register_camera(Box::new(SimCamera::new("cam01")));
        assert_eq!(obs.camera_ids(), vec!["cam00", "cam01", "cam02"]);
    }

    #[test]
    fn re_registering_camera_replaces_old_driver() {
        let mut obs = Observatory::new(Box::new(SimMount::new()));
        obs.register_camera(Box::new(SimCamera::new("cam00")));
        obs.register_camera(Box::new(SimCamera::new("cam00").primary()));
        assert_eq!(obs.cameras().len(), 1);
        assert_eq!(obs.primary_camera_id(), Some("cam00"));
    }

    #[test]
    fn primary_camera_is_optional() {
        let mut obs = Observatory::new(Box::new(SimMount::new()));
        obs.register_camera(Box::new(SimCamera::new("cam00")));
        assert_eq!(obs.primary_camera_id(), None);
    }

    #[test]
    fn dome_operations_without_dome_are_unavailable() {
        let mut obs = Observatory::new(Box::new(SimMount::new()));
        assert!(!obs.has_dome());
        assert!(matches!(
            obs.open_dome(),
            Err(PocsError::DeviceUnavailable { .. })
        ));
        assert!(obs.close_dome().is_err());
    }

    #[test]
    fn dome_open_and_close() {
        let mut obs = Observatory::new(Box::new(SimMount::new()));
        obs.set_dome(Box::new(SimDome::new()));
        assert!(obs.has_dome());
        obs.open_dome().unwrap();
        assert!(obs.is_dome_open());
        obs.close_dome().unwrap();
        assert!(!obs.is_dome_open());
    }

    #[test]
    fn split_mut_gives_mount_and_cameras() {
        let mut obs = Observatory::new(Box::new(SimMount::new()));
        obs.register_camera(Box::new(SimCamera::new("cam00")));
        let (mount, cameras) = obs.split_mut();
        mount.slew_to_home().unwrap();
        assert_eq!(cameras.len(), 1);
    }
}
