//! Coordinated shutdown.
//!
//! SIGTERM or SIGINT trips one cancellation token watched by the HTTP
//! server and the settlement retrier. The retrier needs more than a bare
//! signal: killing it mid-sweep can strand a transaction in
//! `pending_settle` after the facilitator already confirmed, leaving the
//! receipt unrecorded until the next boot. So background workers are
//! spawned through this coordinator and [`Shutdown::drain`] holds process
//! exit until each one finishes its current step, bounded by a deadline.

use std::future::Future;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct Shutdown {
    workers: TaskTracker,
    token: CancellationToken,
}

impl Shutdown {
    /// Registers the signal handlers. Failure here is a startup
    /// misconfiguration.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let on_signal = token.clone();
        tokio::spawn(async move {
            let received = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = received, "shutdown requested");
            on_signal.cancel();
        });
        Ok(Self {
            workers: TaskTracker::new(),
            token,
        })
    }

    /// A token clone for anything that only needs to observe shutdown,
    /// like the HTTP server's graceful-stop future.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns a background worker whose current unit of work must complete
    /// before the process exits. The worker is expected to watch the token
    /// and return once cancelled.
    pub fn spawn_worker<F>(&self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.workers.spawn(worker);
    }

    /// Cancels (if a signal has not already) and waits for every tracked
    /// worker to wind down, up to `deadline`. A worker that overruns is
    /// abandoned with a warning; for the settle retrier that means at
    /// worst one transaction re-settles on next boot, which the
    /// facilitator's nonce handling absorbs.
    pub async fn drain(self, deadline: Duration) {
        self.token.cancel();
        self.workers.close();
        if tokio::time::timeout(deadline, self.workers.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                deadline = ?deadline,
                "background workers did not drain before the deadline"
            );
        }
    }
}
