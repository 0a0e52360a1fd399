//! Rollout liveness deadline.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fires once if no [`progress`](Watchdog::progress) arrives within `timeout`.
pub struct Watchdog {
    beat: watch::Sender<u64>,
    expired: CancellationToken,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm the deadline. Must be called inside a tokio runtime.
    pub fn start(timeout: Duration) -> Self {
        let (beat, mut beats) = watch::channel(0u64);
        let expired = CancellationToken::new();
        let stop = CancellationToken::new();

        let task = {
            let expired = expired.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = stop.cancelled() => return,
                        changed = beats.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        () = tokio::time::sleep(timeout) => {
                            warn!(timeout_secs = timeout.as_secs(), "Watchdog expired without progress");
                            expired.cancel();
                            return;
                        }
                    }
                }
            })
        };

        Self {
            beat,
            expired,
            stop,
            task: Some(task),
        }
    }

    /// Push the deadline out by a full timeout.
    pub fn progress(&self) {
        self.beat.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Token cancelled at expiry, for use inside `select!`.
    pub fn expiry_token(&self) -> CancellationToken {
        self.expired.clone()
    }

    /// Disarm and wait for the timer task to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("Watchdog stopped");
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
