// Graceful drain: refuse new connections, give live sessions a grace period,
// then force-close whatever is left.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notesync_common::protocol::CloseReason;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::session::SessionRegistry;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every session closed on its own within the grace period.
    Idle,
    /// Sessions were still open; `signalled` sockets were told to close.
    Forced { signalled: usize },
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    draining: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        let (stopped, _) = watch::channel(false);
        Self { inner: Arc::new(ShutdownInner { draining: AtomicBool::new(false), stopped }) }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    pub fn begin_drain(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            tracing::info!("drain started, refusing new connections");
        }
    }

    /// Resolves once [`drain`](Self::drain) has finished.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub async fn drain(&self, registry: &SessionRegistry, grace: Duration) -> DrainOutcome {
        self.begin_drain();
        let outcome = if wait_for_idle(registry, grace).await {
            DrainOutcome::Idle
        } else {
            let remaining = registry.session_count().await;
            tracing::warn!(remaining, grace_ms = grace.as_millis() as u64, "grace period elapsed, forcing close");
            let signalled = registry.close_all(CloseReason::ServerShuttingDown).await;
            wait_for_idle(registry, FORCE_CLOSE_WAIT).await;
            DrainOutcome::Forced { signalled }
        };
        self.inner.stopped.send_replace(true);
        tracing::info!(?outcome, "drain finished");
        outcome
    }
}

async fn wait_for_idle(registry: &SessionRegistry, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if registry.is_empty().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
    }
}
