use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Single-use gate that holds every block but the first negotiator until the
/// block layout is settled. Goes from parked to released exactly once.
#[derive(Debug)]
pub struct SplitGate {
    tx: watch::Sender<bool>,
}

impl SplitGate {
    pub fn parked() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A gate with nothing to wait for, used when resuming a known layout.
    pub fn released() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits for release. Cancellation is the only way out while parked.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            let released = *rx.borrow_and_update();
            if released {
                return Ok(());
            }
            tokio::select! {
                biased;
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}
