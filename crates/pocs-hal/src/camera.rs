//! Generic `Camera` trait for exposure-taking devices.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use pocs_types::PocsError;
use tracing::debug;

use crate::task::CaptureTask;

/// A scheduled exposure on a named field, as handed down by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub exposure: Duration,
}

/// A camera attached to the observatory.
///
/// Launching an exposure must not block for its duration: the returned
/// [`CaptureTask`] is awaited separately so several cameras can expose at
/// the same time.
pub trait Camera: Send + Sync {
    /// Stable identifier, e.g. `"cam00"`.  Used to name artifacts.
    fn id(&self) -> &str;

    /// The primary camera's frames are the ones used for analysis.
    fn is_primary(&self) -> bool;

    /// Launch an exposure of `exposure` written to `output`.
    ///
    /// # Errors
    ///
    /// [`PocsError::CaptureLaunch`] or [`PocsError::DeviceUnavailable`] when
    /// the exposure cannot be started.
    fn take_exposure(
        &mut self,
        exposure: Duration,
        output: &Path,
    ) -> Result<Box<dyn CaptureTask>, PocsError>;

    /// Launch the exposure for a scheduled observation.
    ///
    /// Drivers that embed FITS headers override this; the default ignores
    /// `headers` and takes a plain exposure.
    fn take_observation(
        &mut self,
        observation: &Observation,
        headers: &BTreeMap<String, String>,
        output: &Path,
    ) -> Result<Box<dyn CaptureTask>, PocsError> {
        debug!(
            camera = %self.id(),
            field = %observation.name,
            headers = headers.len(),
            "taking observation without header support"
        );
        self.take_exposure(observation.exposure, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EventTask, WaitOutcome};

    struct InstantCamera {
        id: String,
        last_exposure: Option<Duration>,
    }

    impl Camera for InstantCamera {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_primary(&self) -> bool {
            true
        }

        fn take_exposure(
            &mut self,
            exposure: Duration,
            output: &Path,
        ) -> Result<Box<dyn CaptureTask>, PocsError> {
            self.last_exposure = Some(exposure);
            let (task, flag) = EventTask::new(self.id.clone(), output);
            flag.complete();
            Ok(Box::new(task))
        }
    }

    #[tokio::test]
    async fn default_take_observation_uses_observation_exposure() {
        let mut cam = InstantCamera {
            id: "cam00".to_string(),
            last_exposure: None,
        };
        let obs = Observation {
            name: "Wasp 33".to_string(),
            exposure: Duration::from_secs(2),
        };
        let mut task = cam
            .take_observation(&obs, &BTreeMap::new(), Path::new("/tmp/obs.cr2"))
            .unwrap();
        assert_eq!(cam.last_exposure, Some(Duration::from_secs(2)));
        assert_eq!(task.wait(Duration::from_secs(1)).await, WaitOutcome::Completed);
    }
}
