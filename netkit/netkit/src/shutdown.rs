// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Graceful-shutdown plumbing shared by every service.
//!
//! A [`Controller`] owns the broadcast side of the signal. Each spawned
//! activation holds a [`Shutdown`] subscribed to it; the embedded completion
//! sender is dropped with the activation, which is how the controller learns
//! that all in-flight work has drained.

use core::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::debug;

/// Default grace period before remaining activations are abandoned
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Controller {
    notify: broadcast::Sender<()>,
    complete_tx: mpsc::Sender<()>,
    complete_rx: mpsc::Receiver<()>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Self {
            notify,
            complete_tx,
            complete_rx,
        }
    }

    /// Creates a signal handle for a new activation
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify: self.notify.subscribe(),
            _complete: self.complete_tx.clone(),
        }
    }

    /// Signals shutdown and waits up to `grace` for every activation to
    /// drop its handle. Returns `true` when everything drained in time.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let Self {
            notify,
            complete_tx,
            mut complete_rx,
        } = self;

        // receivers may already be gone, which is also a complete drain
        let _ = notify.send(());
        drop(complete_tx);

        match timeout(grace, complete_rx.recv()).await {
            Ok(None) => true,
            Ok(Some(())) => unreachable!("completion channel never carries values"),
            Err(_) => {
                debug!(grace = ?grace, "grace period expired with activations still running");
                false
            }
        }
    }
}

/// Listens for the shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
    _complete: mpsc::Sender<()>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Completes when shutdown is signaled; returns immediately if it
    /// already was
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // a closed channel means the controller is gone, which is shutdown
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            is_shutdown: self.is_shutdown,
            notify: self.notify.resubscribe(),
            _complete: self._complete.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_reaches_every_subscriber() {
        let controller = Controller::new();
        let mut a = controller.subscribe();
        let mut b = controller.subscribe();

        let task = tokio::spawn(async move {
            a.recv().await;
            b.recv().await;
        });

        assert!(controller.shutdown(Duration::from_secs(1)).await);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn grace_period_expires_on_stuck_activation() {
        let controller = Controller::new();
        let stuck = controller.subscribe();

        let drained = controller.shutdown(Duration::from_millis(50)).await;
        assert!(!drained);
        drop(stuck);
    }

    #[tokio::test]
    async fn recv_after_signal_is_immediate() {
        let controller = Controller::new();
        let mut shutdown = controller.subscribe();

        let handle = tokio::spawn(controller.shutdown(Duration::from_secs(1)));
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        shutdown.recv().await;

        drop(shutdown);
        assert!(handle.await.unwrap());
    }
}
