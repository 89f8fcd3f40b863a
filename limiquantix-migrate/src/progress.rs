//! Progress reporting and the suspend-ack handshake.
//!
//! The hypervisor's save routine reports fractional progress through
//! [`report_hypervisor_progress`], which rescales it into the external
//! `0.0..0.95` band -- the remaining 5% belongs to destination-side adopt.
//! Separately, [`suspend_ack_channel`] gives the transmitter's pre-shutdown
//! callback a way to block the save routine until the receiver has
//! confirmed it is ready for the final memory flush (Barrier [1] in the
//! choreography), bounded so a wedged receiver cannot hang the source
//! forever.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::collaborators::AbortSource;
use crate::error::{MigrationError, Result};
use crate::model::MigrationSession;

const SUSPEND_ACK_TIMEOUT: Duration = Duration::from_secs(60);
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Scale and forward a hypervisor-reported `[0, 1]` fraction.
pub async fn report_hypervisor_progress(
    sink: &dyn crate::collaborators::TaskSink,
    fraction: f64,
) -> Result<()> {
    sink.set_progress(MigrationSession::scale_progress(fraction))
        .await
}

/// Build a one-shot suspend-ack pair: the sender is handed to whatever
/// learns the receiver is ready (typically the Barrier [1] response on the
/// handshake channel), the waiter is handed to the hypervisor's
/// pre-shutdown callback.
pub fn suspend_ack_channel() -> (SuspendAckSender, SuspendAckWaiter) {
    let (tx, rx) = oneshot::channel();
    (SuspendAckSender { tx: Some(tx) }, SuspendAckWaiter { rx: Some(rx) })
}

pub struct SuspendAckSender {
    tx: Option<oneshot::Sender<()>>,
}

impl SuspendAckSender {
    /// Signal the ack. A dropped sender (without calling this) is observed
    /// by the waiter as a failure, not a silent pass.
    pub fn ack(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct SuspendAckWaiter {
    rx: Option<oneshot::Receiver<()>>,
}

impl SuspendAckWaiter {
    /// Wait up to 60s for the ack, polling `abort` every 500ms so an
    /// externally cancelled migration doesn't block the save routine for
    /// the full timeout.
    pub async fn wait(self, abort: &dyn AbortSource) -> Result<()> {
        self.wait_with(abort, SUSPEND_ACK_TIMEOUT, ABORT_POLL_INTERVAL)
            .await
    }

    async fn wait_with(
        mut self,
        abort: &dyn AbortSource,
        bound: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let mut rx = self
            .rx
            .take()
            .expect("SuspendAckWaiter::wait called more than once");
        let deadline = Instant::now() + bound;
        let mut ticker = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                res = &mut rx => {
                    return res.map_err(|_| {
                        MigrationError::RemoteFailed("suspend-ack sender dropped".to_string())
                    });
                }
                _ = ticker.tick() => {
                    if abort.is_aborted() {
                        return Err(MigrationError::Aborted);
                    }
                    if Instant::now() >= deadline {
                        return Err(MigrationError::InternalError(
                            "suspend-ack timed out after 60s".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mock::MockAbortSource;

    #[tokio::test]
    async fn ack_resolves_wait_immediately() {
        let (tx, rx) = suspend_ack_channel();
        let abort = MockAbortSource::new();
        tx.ack();
        rx.wait(&abort).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_fails_the_wait() {
        let (tx, rx) = suspend_ack_channel();
        let abort = MockAbortSource::new();
        drop(tx);
        let err = rx.wait(&abort).await.unwrap_err();
        assert!(matches!(err, MigrationError::RemoteFailed(_)));
    }

    #[tokio::test]
    async fn abort_interrupts_the_wait() {
        let (_tx, rx) = suspend_ack_channel();
        let abort = MockAbortSource::new();
        abort.abort();
        let err = rx
            .wait_with(&abort, Duration::from_secs(60), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Aborted));
    }

    #[tokio::test]
    async fn timeout_fires_when_bound_elapses() {
        let (_tx, rx) = suspend_ack_channel();
        let abort = MockAbortSource::new();
        let err = rx
            .wait_with(&abort, Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InternalError(_)));
    }
}
