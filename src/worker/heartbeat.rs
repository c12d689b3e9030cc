use std::time::Duration;
use tokio::task::JoinHandle;

use crate::comm::RankSender;

/// Heartbeat sender that periodically tells the master a job is still running
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
        }
    }

    /// Run the heartbeat sender, pushing the pre-encoded `beat` through `tx`
    pub async fn run(&self, tx: RankSender, beat: Vec<u8>) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            if tx.send_bytes(beat.clone()).is_err() {
                // Master is gone, stop sending
                break;
            }
        }
    }

    /// Run on a background task until the returned guard is stopped or dropped.
    pub fn spawn(self, tx: RankSender, beat: Vec<u8>) -> HeartbeatGuard {
        HeartbeatGuard {
            handle: tokio::spawn(async move { self.run(tx, beat).await }),
        }
    }
}

/// Aborts the heartbeat task when dropped, including during a panic unwind.
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    /// Abort and wait, so no heartbeat can be queued after this returns.
    pub async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
