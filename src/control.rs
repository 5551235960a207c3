//! Run control: pause/resume/stop requests from signals or a control file,
//! consumed cooperatively by the engine and the throttle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Consts;
use crate::error::{CrawlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
    Stopping,
}

/// Shared control switch. Writers are signal handlers and the pause-file
/// poller; readers are the engine and the throttle, which check it at every
/// suspension point.
pub struct CrawlControl {
    state: AtomicU8,
    stop_token: CancellationToken,
    /// Set by the engine once it has committed a checkpoint after a pause
    /// request; lets operators (and tests) know the pause is durable.
    pause_checkpointed: AtomicBool,
}

impl Default for CrawlControl {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            stop_token: CancellationToken::new(),
            pause_checkpointed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ControlState {
        match self.state.load(Ordering::SeqCst) {
            1 => ControlState::Paused,
            2 => ControlState::Stopping,
            _ => ControlState::Running,
        }
    }

    pub fn request_pause(&self, reason: &str) {
        // Stop wins over pause.
        if self
            .state
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.pause_checkpointed.store(false, Ordering::SeqCst);
            tracing::info!(reason, "pause requested");
        }
    }

    pub fn request_resume(&self) {
        if self
            .state
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.pause_checkpointed.store(false, Ordering::SeqCst);
            tracing::info!("resume requested");
        }
    }

    pub fn request_stop(&self, reason: &str) {
        let prior = self.state.swap(2, Ordering::SeqCst);
        if prior != 2 {
            tracing::info!(reason, "stop requested");
        }
        self.stop_token.cancel();
    }

    pub fn toggle_pause(&self) {
        match self.state() {
            ControlState::Running => self.request_pause("pause signal"),
            ControlState::Paused => self.request_resume(),
            ControlState::Stopping => {}
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ControlState::Paused
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == ControlState::Stopping
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }

    pub fn mark_pause_checkpointed(&self) {
        self.pause_checkpointed.store(true, Ordering::SeqCst);
    }

    pub fn pause_checkpointed(&self) -> bool {
        self.pause_checkpointed.load(Ordering::SeqCst)
    }

    /// Non-blocking cancellation check for use between batches.
    pub fn check(&self) -> Result<()> {
        if self.is_stopping() {
            Err(CrawlError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Park while paused; return `Cancelled` once stop is requested.
    pub async fn wait_if_paused(&self) -> Result<()> {
        loop {
            match self.state() {
                ControlState::Stopping => return Err(CrawlError::Cancelled),
                ControlState::Running => return Ok(()),
                ControlState::Paused => {
                    tokio::select! {
                        _ = self.stop_token.cancelled() => return Err(CrawlError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(
                            Consts::CONTROL_CHECK_INTERVAL_MS,
                        )) => {}
                    }
                }
            }
        }
    }
}

/// Poll a control file once a second. The file holds exactly one of
/// `pause`, `resume`, `stop` (case-insensitive, surrounding whitespace
/// ignored); anything else is logged once and ignored.
pub fn spawn_pause_file_poller(
    control: Arc<CrawlControl>,
    path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_warned: Option<String> = None;
        loop {
            tokio::select! {
                _ = control.stop_token().cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(Consts::PAUSE_FILE_POLL_MS)) => {}
            }

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(_) => continue, // absent file means no command
            };
            match content.trim().to_ascii_lowercase().as_str() {
                "pause" => control.request_pause("control file"),
                "resume" => control.request_resume(),
                "stop" => {
                    control.request_stop("control file");
                    break;
                }
                "" => {}
                other => {
                    if last_warned.as_deref() != Some(other) {
                        tracing::warn!(
                            content = other,
                            file = %path.display(),
                            "ignoring malformed control file content"
                        );
                        last_warned = Some(other.to_string());
                    }
                }
            }
        }
    })
}

/// Wire process signals into the control switch: INT/TERM stop the run,
/// USR1 toggles pause.
#[cfg(unix)]
pub fn spawn_signal_handlers(control: Arc<CrawlControl>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut pause_toggle = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGUSR1 handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    control.request_stop("SIGINT");
                    break;
                }
                _ = terminate.recv() => {
                    control.request_stop("SIGTERM");
                    break;
                }
                _ = pause_toggle.recv() => control.toggle_pause(),
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_signal_handlers(control: Arc<CrawlControl>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            control.request_stop("ctrl-c");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let control = CrawlControl::new();
        assert_eq!(control.state(), ControlState::Running);

        control.request_pause("test");
        assert!(control.is_paused());

        control.request_resume();
        assert_eq!(control.state(), ControlState::Running);

        control.request_stop("test");
        assert!(control.is_stopping());
        // Stop is terminal: pause/resume no longer apply.
        control.request_pause("late");
        assert!(control.is_stopping());
        assert!(control.check().is_err());
    }

    #[test]
    fn test_toggle_pause() {
        let control = CrawlControl::new();
        control.toggle_pause();
        assert!(control.is_paused());
        control.toggle_pause();
        assert_eq!(control.state(), ControlState::Running);
    }

    #[tokio::test]
    async fn test_wait_if_paused_returns_cancelled_on_stop() {
        let control = Arc::new(CrawlControl::new());
        control.request_pause("test");

        let waiter = Arc::clone(&control);
        let handle = tokio::spawn(async move { waiter.wait_if_paused().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        control.request_stop("test");
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CrawlError::Cancelled)));
    }

    #[tokio::test]
    async fn test_pause_file_poller_parses_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("control");
        let control = Arc::new(CrawlControl::new());
        let handle = spawn_pause_file_poller(Arc::clone(&control), path.clone());

        std::fs::write(&path, "PAUSE\n").unwrap();
        for _ in 0..40 {
            if control.is_paused() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(control.is_paused());

        std::fs::write(&path, "stop").unwrap();
        for _ in 0..40 {
            if control.is_stopping() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(control.is_stopping());
        let _ = handle.await;
    }
}
