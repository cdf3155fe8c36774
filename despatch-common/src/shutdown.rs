//! Cooperative cancellation shared by the scheduler and everything it drives.
//!
//! The handle is checked between units of work and raced against every
//! suspension point, so a shutdown request takes effect at the next yield
//! rather than preemptively.

use std::future::Future;

use tokio::sync::broadcast::{Receiver, error::TryRecvError};

use crate::Signal;

#[derive(Debug)]
pub struct Shutdown {
    receiver: Option<Receiver<Signal>>,
    triggered: bool,
}

impl Shutdown {
    #[must_use]
    pub const fn new(receiver: Receiver<Signal>) -> Self {
        Self {
            receiver: Some(receiver),
            triggered: false,
        }
    }

    /// A handle that never fires.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            receiver: None,
            triggered: false,
        }
    }

    /// Non-blocking check. Once observed, the shutdown stays triggered.
    pub fn is_triggered(&mut self) -> bool {
        if self.triggered {
            return true;
        }

        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };

        match receiver.try_recv() {
            Ok(Signal::Shutdown) | Err(TryRecvError::Closed | TryRecvError::Lagged(_)) => {
                self.triggered = true;
            }
            Err(TryRecvError::Empty) => {}
        }

        self.triggered
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        if self.triggered {
            return;
        }

        match self.receiver.as_mut() {
            // Every outcome of `recv` (a signal, a lag or a closed channel) means stop.
            Some(receiver) => {
                let _ = receiver.recv().await;
                self.triggered = true;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Run `fut` to completion unless shutdown is requested first, in which case
    /// `None` is returned and `fut` is dropped.
    pub async fn guard<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        if self.is_triggered() {
            return None;
        }

        tokio::select! {
            biased;

            () = self.wait() => None,
            output = fut => Some(output),
        }
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.as_ref().map(Receiver::resubscribe),
            triggered: self.triggered,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;

    #[tokio::test]
    async fn never_fires() {
        let mut shutdown = Shutdown::never();
        assert!(!shutdown.is_triggered());
        assert_eq!(shutdown.guard(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn triggered_after_signal() {
        let (tx, rx) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(rx);

        assert!(!shutdown.is_triggered());
        tx.send(Signal::Shutdown).unwrap();
        assert!(shutdown.is_triggered());
        assert!(shutdown.is_triggered(), "shutdown should latch");
    }

    #[tokio::test]
    async fn guard_cancels_pending_future() {
        let (tx, rx) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(rx);

        let handle = tokio::spawn(async move {
            shutdown
                .guard(tokio::time::sleep(Duration::from_secs(3600)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(Signal::Shutdown).unwrap();

        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, rx) = broadcast::channel::<Signal>(1);
        let mut shutdown = Shutdown::new(rx);
        drop(tx);

        assert!(shutdown.is_triggered());
    }
}
