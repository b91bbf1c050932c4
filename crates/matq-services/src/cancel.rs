//! Cancellation signal for a run.

use std::sync::Arc;

use tokio::sync::watch;

/// Raises the signal. Clones share it.
#[derive(Clone)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes the signal.
#[derive(Clone)]
pub struct CancelFlag {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (Canceller, CancelFlag) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx: Arc::new(tx) }, CancelFlag { rx })
}

impl Canceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn flag(&self) -> CancelFlag {
        CancelFlag {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelFlag {
    /// A flag nobody can raise.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised. Pends forever if it never can be.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
