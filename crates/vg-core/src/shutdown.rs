use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Cooperative shutdown coordinator shared by the daemon's workers.
///
/// Workers call [`subscribe`](ShutdownSignal::subscribe) and `select!` on the
/// returned receiver next to their timer loop. The orchestrator calls
/// [`trigger`](ShutdownSignal::trigger) once, then
/// [`wait_for_drain`](ShutdownSignal::wait_for_drain) to give in-flight work
/// a bounded grace period before the process exits.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    drained_tx: Arc<watch::Sender<usize>>,
    drained_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(0);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
            drained_tx: Arc::new(drained_tx),
            drained_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Broadcast shutdown to every subscriber. Idempotent.
    pub fn trigger(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown triggered");
            let _ = self.tx.send(());
        }
    }

    /// A worker calls this once after it has finished draining.
    pub fn confirm_drained(&self) {
        self.drained_tx.send_modify(|n| *n += 1);
    }

    /// Wait until `expected` workers have confirmed drain, or the grace
    /// period expires. Returns `true` when all confirmed in time.
    pub async fn wait_for_drain(&mut self, expected: usize, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let confirmed = *self.drained_rx.borrow();
            if confirmed >= expected {
                info!(confirmed, "all workers drained");
                return true;
            }
            match tokio::time::timeout_at(deadline, self.drained_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return *self.drained_rx.borrow() >= expected,
                Err(_) => {
                    warn!(
                        confirmed = *self.drained_rx.borrow(),
                        expected, "shutdown grace period expired"
                    );
                    return false;
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
