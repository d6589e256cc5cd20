//! Awaitable capture tasks.
//!
//! Launching an exposure returns a [`CaptureTask`].  The orchestrator never
//! cares how the exposure is carried out; it only waits with a timeout and,
//! when needed, cancels.  Two variants exist:
//!
//! | Variant | Backed by | `cancel` |
//! |---|---|---|
//! | [`ProcessTask`] | an external process (`tokio::process::Child`) | kill, reap, drain output |
//! | [`EventTask`] | a completion flag set by the producer | signal abort to the producer |

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pocs_types::PocsError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on reaping a killed process and reading its leftover output.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes of each output stream kept for the debug log.
const OUTPUT_TAIL: usize = 8 * 1024;

/// Result of waiting on a [`CaptureTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The capture finished within the timeout.
    Completed,
    /// The timeout elapsed first.  The task is still running until cancelled.
    TimedOut,
    /// The capture finished but reported a failure.
    Failed(String),
}

/// A launched exposure that can be awaited with a bound and cancelled.
#[async_trait]
pub trait CaptureTask: Send {
    /// Device that launched the capture.
    fn device_id(&self) -> &str;

    /// Where the captured artifact will be written.
    fn output_path(&self) -> &Path;

    /// Wait at most `timeout` for the capture to finish.
    ///
    /// Cancel-safe: dropping the returned future leaves the task intact.
    async fn wait(&mut self, timeout: Duration) -> WaitOutcome;

    /// Terminate the capture and release its resources.  Idempotent; a
    /// no-op on a task that already finished.
    async fn cancel(&mut self);
}

// ────────────────────────────────────────────────────────────────────────────
// Process-backed task
// ────────────────────────────────────────────────────────────────────────────

/// A capture carried out by an external process.
///
/// The child is spawned with `kill_on_drop`, so a task that is dropped
/// without being resolved never leaves a process behind.  Its stdout and
/// stderr are read continuously from the moment it starts, so a chatty
/// command never stalls on a full pipe.
pub struct ProcessTask {
    device_id: String,
    output_path: PathBuf,
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    outcome: Option<WaitOutcome>,
}

/// Read `pipe` to EOF, keeping only the last [`OUTPUT_TAIL`] bytes.
async fn collect_tail<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > OUTPUT_TAIL {
                    let excess = tail.len() - OUTPUT_TAIL;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

/// Join an output reader, giving up after [`DRAIN_TIMEOUT`].
async fn join_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut handle) = reader else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            // A grandchild still holds the pipe open.
            handle.abort();
            Vec::new()
        }
    }
}

impl ProcessTask {
    /// Spawn `command` as the capture for `device_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PocsError::CaptureLaunch`] when the process cannot start.
    pub fn spawn(
        device_id: impl Into<String>,
        output_path: impl Into<PathBuf>,
        mut command: Command,
    ) -> Result<Self, PocsError> {
        let device_id = device_id.into();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| PocsError::CaptureLaunch {
            device: device_id.clone(),
            reason: e.to_string(),
        })?;
        debug!(device = %device_id, pid = ?child.id(), "capture process started");
        let stdout = child.stdout.take().map(|pipe| tokio::spawn(collect_tail(pipe)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(collect_tail(pipe)));
        Ok(Self {
            device_id,
            output_path: output_path.into(),
            child,
            stdout,
            stderr,
            outcome: None,
        })
    }

    /// OS process id, or `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn drain(&mut self) {
        let (stdout, stderr) =
            tokio::join!(join_reader(self.stdout.take()), join_reader(self.stderr.take()));
        if !stdout.is_empty() || !stderr.is_empty() {
            debug!(
                device = %self.device_id,
                stdout = %String::from_utf8_lossy(&stdout).trim(),
                stderr = %String::from_utf8_lossy(&stderr).trim(),
                "capture process output"
            );
        }
    }
}

#[async_trait]
impl CaptureTask for ProcessTask {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match tokio::time::timeout(timeout, self.child.wait()).await {
            Err(_) => return WaitOutcome::TimedOut,
            Ok(Ok(status)) if status.success() => WaitOutcome::Completed,
            Ok(Ok(status)) => WaitOutcome::Failed(format!("capture process exited with {status}")),
            Ok(Err(e)) => WaitOutcome::Failed(e.to_string()),
        };
        self.drain().await;
        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn cancel(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            debug!(device = %self.device_id, error = %e, "capture process already gone");
        }
        match tokio::time::timeout(DRAIN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(device = %self.device_id, %status, "capture process terminated");
            }
            Ok(Err(e)) => warn!(device = %self.device_id, error = %e, "failed to reap capture process"),
            Err(_) => warn!(device = %self.device_id, "capture process did not exit after kill"),
        }
        self.drain().await;
        self.outcome = Some(WaitOutcome::Failed("cancelled".to_string()));
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event-backed task
// ────────────────────────────────────────────────────────────────────────────

type Completion = Option<Result<(), String>>;

/// Producer half of an [`EventTask`].
///
/// Whoever performs the capture calls [`complete`][Self::complete] or
/// [`fail`][Self::fail], and should stop early once
/// [`abort_token`][Self::abort_token] is cancelled.
pub struct CompletionFlag {
    done: watch::Sender<Completion>,
    abort: CancellationToken,
}

impl CompletionFlag {
    /// Mark the capture as successfully finished.
    pub fn complete(&self) {
        self.done.send_replace(Some(Ok(())));
    }

    /// Mark the capture as finished with an error.
    pub fn fail(&self, reason: impl Into<String>) {
        self.done.send_replace(Some(Err(reason.into())));
    }

    /// Cancelled when the consumer gives up on the capture.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

/// A capture whose completion is signalled through a [`CompletionFlag`].
pub struct EventTask {
    device_id: String,
    output_path: PathBuf,
    done: watch::Receiver<Completion>,
    abort: CancellationToken,
}

impl EventTask {
    /// Create a task and the flag its producer will set.
    pub fn new(
        device_id: impl Into<String>,
        output_path: impl Into<PathBuf>,
    ) -> (Self, CompletionFlag) {
        let (tx, rx) = watch::channel(None);
        let abort = CancellationToken::new();
        let task = Self {
            device_id: device_id.into(),
            output_path: output_path.into(),
            done: rx,
            abort: abort.clone(),
        };
        (task, CompletionFlag { done: tx, abort })
    }
}

#[async_trait]
impl CaptureTask for EventTask {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        let state = match tokio::time::timeout(timeout, self.done.wait_for(Option::is_some)).await
        {
            Err(_) => return WaitOutcome::TimedOut,
            Ok(Err(_)) => {
                return WaitOutcome::Failed("capture producer went away".to_string());
            }
            Ok(Ok(state)) => state.clone(),
        };
        match state {
            Some(Ok(())) => WaitOutcome::Completed,
            Some(Err(reason)) => WaitOutcome::Failed(reason),
            None => WaitOutcome::Failed("capture producer went away".to_string()),
        }
    }

    async fn cancel(&mut self) {
        self.abort.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn event_task_completes_when_flag_is_set() {
        let (mut task, flag) = EventTask::new("cam00", "/tmp/cam00.cr2");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            flag.complete();
        });
        assert_eq!(task.wait(Duration::from_secs(20)).await, WaitOutcome::Completed);
        assert_eq!(task.device_id(), "cam00");
        assert_eq!(task.output_path(), Path::new("/tmp/cam00.cr2"));
    }

    #[tokio::test(start_paused = true)]
    async fn event_task_times_out_and_cancel_reaches_producer() {
        let (mut task, flag) = EventTask::new("cam01", "/tmp/cam01.cr2");
        let start = tokio::time::Instant::now();
        assert_eq!(task.wait(Duration::from_secs(20)).await, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(20));

        assert!(!flag.is_aborted());
        task.cancel().await;
        assert!(flag.is_aborted());
    }

    #[tokio::test]
    async fn event_task_reports_failure_and_dropped_producer() {
        let (mut task, flag) = EventTask::new("cam02", "/tmp/cam02.cr2");
        flag.fail("shutter stuck");
        assert_eq!(
            task.wait(Duration::from_secs(1)).await,
            WaitOutcome::Failed("shutter stuck".to_string())
        );

        let (mut task, flag) = EventTask::new("cam03", "/tmp/cam03.cr2");
        drop(flag);
        assert!(matches!(
            task.wait(Duration::from_secs(1)).await,
            WaitOutcome::Failed(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_task_completes_and_fails_by_exit_status() {
        let mut ok = ProcessTask::spawn("cam00", "/tmp/x", Command::new("true")).unwrap();
        assert_eq!(ok.wait(Duration::from_secs(5)).await, WaitOutcome::Completed);
        // Resolved tasks keep their outcome and ignore cancel.
        ok.cancel().await;
        assert_eq!(ok.wait(Duration::from_secs(5)).await, WaitOutcome::Completed);

        let mut bad = ProcessTask::spawn("cam01", "/tmp/y", Command::new("false")).unwrap();
        assert!(matches!(
            bad.wait(Duration::from_secs(5)).await,
            WaitOutcome::Failed(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_task_timeout_then_cancel_kills_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut task = ProcessTask::spawn("cam00", "/tmp/z", cmd).unwrap();
        assert!(task.pid().is_some());

        assert_eq!(
            task.wait(Duration::from_millis(100)).await,
            WaitOutcome::TimedOut
        );
        task.cancel().await;
        assert!(task.child.try_wait().unwrap().is_some());
        assert!(task.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_task_with_large_output_still_completes() {
        // Well past the pipe buffer on both streams.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("head -c 200000 /dev/zero; head -c 200000 /dev/zero >&2; exit 0");
        let mut task = ProcessTask::spawn("cam00", "/tmp/chatty", cmd).unwrap();
        assert_eq!(task.wait(Duration::from_secs(3)).await, WaitOutcome::Completed);
        assert!(task.stdout.is_none());
        assert!(task.stderr.is_none());
    }

    #[tokio::test]
    async fn collect_tail_keeps_only_the_end_of_the_stream() {
        let mut data = vec![b'a'; OUTPUT_TAIL];
        data.extend_from_slice(b"last line");
        let tail = collect_tail(&data[..]).await;
        assert_eq!(tail.len(), OUTPUT_TAIL);
        assert!(tail.ends_with(b"last line"));
    }

    #[test]
    fn spawn_failure_is_a_launch_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let result = ProcessTask::spawn(
                "cam09",
                "/tmp/never",
                Command::new("/nonexistent/capture-binary"),
            );
            assert!(matches!(result, Err(PocsError::CaptureLaunch { .. })));
        });
    }
}
