//! [`ProcessCamera`] – a camera whose exposures are external commands.
//!
//! The command is an argv template.  Two placeholders are substituted in
//! every argument:
//!
//! | Placeholder | Replaced with |
//! |---|---|
//! | `{seconds}` | exposure length in whole seconds (rounded up, minimum 1) |
//! | `{filename}` | output path |
//!
//! A DSLR driven by gphoto2 in bulb mode would use, for example:
//!
//! ```text
//! gphoto2 --port usb:001,004 --set-config-index eosremoterelease=2
//!         --wait-event={seconds}s --set-config-index eosremoterelease=4
//!         --wait-event-and-download=2s --filename {filename}
//! ```

use std::path::Path;
use std::time::Duration;

use pocs_types::PocsError;
use tokio::process::Command;
use tracing::info;

use crate::camera::Camera;
use crate::task::{CaptureTask, ProcessTask};

/// A camera driven by spawning one external process per exposure.
pub struct ProcessCamera {
    id: String,
    primary: bool,
    argv: Vec<String>,
}

impl ProcessCamera {
    /// Create a camera from an argv template.
    ///
    /// # Errors
    ///
    /// [`PocsError::Config`] when `argv` is empty.
    pub fn new(
        id: impl Into<String>,
        primary: bool,
        argv: Vec<String>,
    ) -> Result<Self, PocsError> {
        let id = id.into();
        if argv.is_empty() {
            return Err(PocsError::Config(format!(
                "camera '{id}' has an empty capture command"
            )));
        }
        Ok(Self { id, primary, argv })
    }

    /// Expand the argv template for one exposure.
    pub fn render_args(&self, exposure: Duration, output: &Path) -> Vec<String> {
        let seconds = exposure.as_secs_f64().ceil().max(1.0) as u64;
        let filename = output.display().to_string();
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{seconds}", &seconds.to_string())
                    .replace("{filename}", &filename)
            })
            .collect()
    }
}

impl Camera for ProcessCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn take_exposure(
        &mut self,
        exposure: Duration,
        output: &Path,
    ) -> Result<Box<dyn CaptureTask>, PocsError> {
        if let Some(dir) = output.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let args = self.render_args(exposure, output);
        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        info!(camera = %self.id, ?exposure, output = %output.display(), "starting exposure");
        let task = ProcessTask::spawn(self.id.clone(), output, command)?;
        Ok(Box::new(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::WaitOutcome;

    #[test]
    fn empty_command_is_a_config_error() {
        assert!(matches!(
            ProcessCamera::new("cam00", true, Vec::new()),
            Err(PocsError::Config(_))
        ));
    }

    #[test]
    fn placeholders_are_substituted() {
        let cam = ProcessCamera::new(
            "cam00",
            true,
            vec![
                "gphoto2".into(),
                "--wait-event={seconds}s".into(),
                "--filename".into(),
                "{filename}".into(),
            ],
        )
        .unwrap();
        let args = cam.render_args(Duration::from_millis(29_500), Path::new("/data/pole.cr2"));
        assert_eq!(
            args,
            vec!["gphoto2", "--wait-event=30s", "--filename", "/data/pole.cr2"]
        );

        let args = cam.render_args(Duration::ZERO, Path::new("/x"));
        assert_eq!(args[1], "--wait-event=1s");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exposure_runs_the_command_and_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested").join("cam00.cr2");
        let mut cam = ProcessCamera::new(
            "cam00",
            false,
            vec!["touch".into(), "{filename}".into()],
        )
        .unwrap();

        let mut task = cam.take_exposure(Duration::from_secs(1), &output).unwrap();
        assert_eq!(task.wait(Duration::from_secs(5)).await, WaitOutcome::Completed);
        assert!(output.exists());
    }
}
