//! Online/offline tracking.
//!
//! `Connectivity` is a cheap cloneable handle over a watch channel. The host
//! reports platform network changes through `set_online`; only real
//! transitions notify subscribers. `ConnectivityMonitor` reacts to those
//! transitions by flushing the retry queue when the device comes back.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::queue::RetryQueue;

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current connectivity. Returns true if this was a
    /// transition; repeated reports of the same state are ignored.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Flushes the queue on reconnect and refreshes status on disconnect.
pub struct ConnectivityMonitor {
    rx: watch::Receiver<bool>,
    queue: Arc<RetryQueue>,
}

impl ConnectivityMonitor {
    /// Subscribes immediately, so transitions after construction are seen
    /// even if the monitor task has not started yet.
    pub fn new(connectivity: &Connectivity, queue: Arc<RetryQueue>) -> Self {
        Self {
            rx: connectivity.subscribe(),
            queue,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Watch for transitions. Runs until the task is aborted.
    pub async fn run(mut self) {
        while self.rx.changed().await.is_ok() {
            let online = *self.rx.borrow_and_update();
            self.on_transition(online).await;
        }
        debug!("Connectivity monitor stopped");
    }

    pub async fn on_transition(&self, online: bool) {
        if online {
            let outcome = self.queue.flush(false).await;
            debug!(?outcome, "Reconnect flush finished");
        } else {
            self.queue.publish_status();
        }
    }
}
