use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot, many-listener signal, used for shutdown.
///
/// - Multi-producer and multi-consumer: clone to get another handle.
/// - Listeners that subscribe (or clone) after the signal was sent still
///   observe it.
/// - Sending more than once is harmless.
/// - [`recv`] resolves whenever a signal *has been* sent, including on
///   repeated calls. Every satchel supervisor exits its select loop on
///   the first observation, so there is deliberately no at-most-once
///   bookkeeping per handle; a loop that kept polling [`recv`] after a
///   signal would spin, not hang.
///
/// Internally a `watch` channel over a `bool` that only ever flips to
/// `true`. Every handle holds the sender, so the channel cannot close
/// while a listener is waiting.
///
/// [`recv`]: NotifyOnce::recv
#[derive(Clone, Debug)]
pub struct NotifyOnce {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl NotifyOnce {
    /// Construct a new [`NotifyOnce`].
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Send the signal, waking all current and future listeners.
    pub fn send(&self) {
        self.tx.send_replace(true);
    }

    /// Wait until the signal has been sent.
    pub async fn recv(&mut self) {
        // The only error is all-senders-dropped, and every handle holds
        // one, so the channel outlives every caller.
        let _ = self.rx.wait_for(|&sent| sent).await;
    }

    /// Waits for the signal, taking ownership of the handle. Useful for
    /// graceful shutdown APIs which require `impl Future<Output = ()> +
    /// 'static`, e.g. `axum`'s `with_graceful_shutdown`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Immediately returns whether the signal has been sent.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod test {
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[test]
    fn multiple_sends_doesnt_panic() {
        let shutdown = NotifyOnce::new();
        shutdown.send();
        shutdown.send();
        shutdown.send();
    }

    #[test]
    fn send_wakes_pending_listener() {
        let shutdown1 = NotifyOnce::new();
        let mut shutdown2 = shutdown1.clone();

        let mut recv_task = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv_task.poll());

        shutdown1.send();

        assert!(recv_task.is_woken());
        assert_ready!(recv_task.poll());
    }

    #[test]
    fn recv_resolves_repeatedly_after_send() {
        let shutdown = NotifyOnce::new();
        shutdown.send();

        // Unlike a consumed-once channel, every recv after the signal
        // completes immediately; supervisors rely on this when several
        // select arms race the same handle.
        let mut handle = shutdown.clone();
        for _ in 0..3 {
            let mut recv_task = tokio_test::task::spawn(handle.recv());
            assert_ready!(recv_task.poll());
        }
    }

    #[test]
    fn late_subscribers_observe_the_signal() {
        let shutdown1 = NotifyOnce::new();
        shutdown1.send();

        // Cloned after the signal was sent.
        let shutdown2 = shutdown1.clone();
        assert!(shutdown2.try_recv());

        let mut recv_task =
            tokio_test::task::spawn(shutdown2.recv_owned());
        assert_ready!(recv_task.poll());
    }

    #[tokio::test]
    async fn one_sender_many_listeners() {
        let shutdown = NotifyOnce::new();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let listener = shutdown.clone();
            tasks.push(tokio::spawn(listener.recv_owned()));
        }

        shutdown.send();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
