use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn, Instrument};

use crate::notify_once::NotifyOnce;

/// Errors that can occur when joining the node's tasks.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Task finished prematurely: {name}")]
    PrematureFinish { name: String },
    #[error("Some tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// The node's long-lived tasks, split by shutdown phase.
///
/// Shutdown is ordered: supervisors are cancelled first and drained while
/// the transport is still up, so teardown work (a final send, a persisted
/// transition) has a live transport under it; only then is the transport
/// told to stop. Both phases share one deadline, so shutdown completes in
/// bounded time even if a supervisor is mid-sleep.
pub struct TaskGroups {
    /// Relay maintenance, message pumps, announcers, servers. Cancelled
    /// by the primary shutdown signal.
    pub supervisors: Vec<SatTask<()>>,
    /// The swarm driver (and anything else that must outlive the
    /// supervisors). Cancelled by the transport shutdown signal, which
    /// the joiner sends once the supervisors are done.
    pub transport: Vec<SatTask<()>>,
}

/// Join the node's tasks until shutdown, enforcing the two-phase
/// teardown described on [`TaskGroups`].
///
/// - Any long-lived task finishing early is a partial failure: the
///   remaining tasks are shut down and an error is returned.
/// - "ephemeral" tasks sent over `eph_tasks_rx` are polled so panics
///   propagate, but may finish freely.
/// - Tasks still running `shutdown_timeout` after the shutdown signal are
///   reported as hung; the transport is told to stop regardless.
///
/// NOTE: To propagate panics beyond this function, the callsite must
/// still poll the future returned here, and so on up to the top-level
/// future!
pub async fn try_join_tasks_and_shutdown(
    groups: TaskGroups,
    mut eph_tasks_rx: mpsc::Receiver<SatTask<()>>,
    mut shutdown: NotifyOnce,
    transport_shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) -> Result<(), Error> {
    let TaskGroups {
        supervisors,
        transport,
    } = groups;
    let mut supervisor_names: Vec<String> =
        supervisors.iter().map(|task| task.name().to_owned()).collect();
    let mut transport_names: Vec<String> =
        transport.iter().map(|task| task.name().to_owned()).collect();

    let mut supervisors: FuturesUnordered<_> =
        supervisors.into_iter().map(join_named).collect();
    let mut transport: FuturesUnordered<_> =
        transport.into_iter().map(join_named).collect();
    let mut ephemeral = FuturesUnordered::new();

    let mut result = Ok(());

    // Run until a shutdown signal and poll all tasks.
    loop {
        tokio::select! {
            // Mitigate possible select! race after a shutdown signal is
            // sent
            biased;
            () = shutdown.recv() => break,
            Some(task) = eph_tasks_rx.recv() => {
                debug!("Received ephemeral task: {name}", name = task.name());
                ephemeral.push(join_named(task));
            }
            Some((name, outcome)) = ephemeral.next() => {
                log_outcome(&name, &outcome);
            }
            Some((name, outcome)) = supervisors.next() => {
                log_outcome(&name, &outcome);
                remove_name(&mut supervisor_names, &name);
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
            Some((name, outcome)) = transport.next() => {
                log_outcome(&name, &outcome);
                remove_name(&mut transport_names, &name);
                result = Err(Error::PrematureFinish { name });
                break shutdown.send();
            }
        }
    }

    // One deadline bounds both phases.
    let deadline = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(deadline);

    // Phase one: drain supervisors and ephemeral work while the
    // transport is still up.
    while !(supervisors.is_empty() && ephemeral.is_empty()) {
        tokio::select! {
            Some((name, outcome)) = supervisors.next() => {
                log_outcome(&name, &outcome);
                remove_name(&mut supervisor_names, &name);
            }
            Some((name, outcome)) = ephemeral.next() => {
                log_outcome(&name, &outcome);
            }
            () = &mut deadline => {
                let mut hung_tasks = supervisor_names;
                hung_tasks.extend(transport_names);
                // Stop the transport anyway; we just don't wait for it.
                transport_shutdown.send();
                return Err(Error::Hung { hung_tasks });
            }
        }
    }

    // Phase two: the supervisors are done; stop the transport.
    transport_shutdown.send();
    while !transport.is_empty() {
        tokio::select! {
            Some((name, outcome)) = transport.next() => {
                log_outcome(&name, &outcome);
                remove_name(&mut transport_names, &name);
            }
            () = &mut deadline => {
                return Err(Error::Hung {
                    hung_tasks: transport_names,
                });
            }
        }
    }

    result
}

/// Shorthand to call [`try_join_tasks_and_shutdown`] and log any errors,
/// useful when the callsite needs a `Future<Output = ()> + Send +
/// 'static`.
pub async fn join_tasks_and_shutdown(
    name: &str,
    groups: TaskGroups,
    eph_tasks_rx: mpsc::Receiver<SatTask<()>>,
    shutdown: NotifyOnce,
    transport_shutdown: NotifyOnce,
    shutdown_timeout: Duration,
) {
    let result = try_join_tasks_and_shutdown(
        groups,
        eph_tasks_rx,
        shutdown,
        transport_shutdown,
        shutdown_timeout,
    )
    .await;

    match result {
        Ok(()) => info!("{name} tasks finished."),
        Err(e) => error!("{name} tasks errored: {e:#}"),
    }
}

/// Await a task, carrying its name alongside the outcome so the joiner
/// can report on it after the handle is consumed.
async fn join_named(task: SatTask<()>) -> (String, Result<(), JoinError>) {
    let name = task.name().to_owned();
    let outcome = task.await;
    (name, outcome)
}

fn log_outcome(name: &str, outcome: &Result<(), JoinError>) {
    match outcome {
        Ok(()) => info!("Task '{name}' finished"),
        Err(e) if e.is_cancelled() => warn!("Task '{name}' cancelled"),
        Err(e) => error!("Task '{name}' failed: {e:#}"),
    }
}

fn remove_name(names: &mut Vec<String>, name: &str) {
    if let Some(index) = names.iter().position(|n| n == name) {
        names.remove(index);
    }
}

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) propagates panics instead of catching them
/// (2) adds the `#[must_use]` lint to ensure that all spawned tasks are
///     joined or explictly annotated that no joining is required. Use
///     [`SatTask::detach`] to make it clear that the spawned task should
///     be detached from the handle. Once detached, a task can't be
///     joined.
///
/// The goal is structured concurrency: the node hands every long-lived
/// handle to [`try_join_tasks_and_shutdown`], so a dead supervisor is
/// noticed (and takes the node down with an error) instead of leaving a
/// half-alive process. Consequently, [`SatTask::detach`] should be used
/// sparingly.
///
/// The task name feeds the joiner's premature-finish and hung-task
/// reporting, so pick one that identifies the task uniquely.
#[must_use]
pub struct SatTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> SatTask<T> {
    /// Spawns a named task which inherits from the current span.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> SatTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        // Instrument the future so that the current tracing span
        // propagates past spawn boundaries.
        let span = tracing::Span::current();
        Self {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Spawns a task without a name. Use this primarily for trivial tasks
    /// where you don't care about joining later (e.g. a task that makes
    /// an API call).
    #[inline]
    pub fn spawn_unnamed<F>(future: F) -> SatTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        Self::spawn(String::new(), future)
    }

    /// Drop the task handle, detaching it so it continues running in the
    /// background. Without a handle, you can no longer `.await` the task
    /// itself to get the output.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls [`is_finished`] on the underlying [`JoinHandle`].
    ///
    /// [`is_finished`]: tokio::task::JoinHandle::is_finished
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for SatTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = result.map_err(|join_err| {
            match join_err.try_into_panic() {
                // If the inner spawned task panicked, propagate the panic
                // to the poller.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name);
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => join_err,
            }
        });

        Poll::Ready(result)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn groups(
        supervisors: Vec<SatTask<()>>,
        transport: Vec<SatTask<()>>,
    ) -> TaskGroups {
        TaskGroups {
            supervisors,
            transport,
        }
    }

    #[tokio::test]
    async fn premature_supervisor_finish_triggers_shutdown() {
        let shutdown = NotifyOnce::new();
        let transport_shutdown = NotifyOnce::new();
        let (_eph_tx, eph_rx) = mpsc::channel(1);

        let supervisors =
            vec![SatTask::spawn("finishes early", async move {})];
        let mut driver_shutdown = transport_shutdown.clone();
        let transport = vec![SatTask::spawn("driver", async move {
            driver_shutdown.recv().await;
        })];

        let result = try_join_tasks_and_shutdown(
            groups(supervisors, transport),
            eph_rx,
            shutdown.clone(),
            transport_shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(Error::PrematureFinish { .. })));
        assert!(shutdown.try_recv());
        // The transport was still torn down in order.
        assert!(transport_shutdown.try_recv());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_stops_after_supervisors() {
        let shutdown = NotifyOnce::new();
        let transport_shutdown = NotifyOnce::new();
        let (_eph_tx, eph_rx) = mpsc::channel(1);

        let order = Arc::new(Mutex::new(Vec::new()));

        // A supervisor with slow teardown work after the signal.
        let mut supervisor_shutdown = shutdown.clone();
        let supervisor_order = order.clone();
        let supervisors = vec![SatTask::spawn("supervisor", async move {
            supervisor_shutdown.recv().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            supervisor_order.lock().unwrap().push("supervisor");
        })];

        let mut driver_shutdown = transport_shutdown.clone();
        let driver_order = order.clone();
        let transport = vec![SatTask::spawn("driver", async move {
            driver_shutdown.recv().await;
            driver_order.lock().unwrap().push("transport");
        })];

        shutdown.send();
        try_join_tasks_and_shutdown(
            groups(supervisors, transport),
            eph_rx,
            shutdown,
            transport_shutdown,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // The transport only stopped once the supervisor was done.
        assert_eq!(*order.lock().unwrap(), vec!["supervisor", "transport"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_supervisor_reported_in_bounded_time() {
        let shutdown = NotifyOnce::new();
        let transport_shutdown = NotifyOnce::new();
        let (_eph_tx, eph_rx) = mpsc::channel(1);

        let supervisors = vec![SatTask::spawn("hangs forever", async move {
            std::future::pending::<()>().await
        })];
        let mut driver_shutdown = transport_shutdown.clone();
        let transport = vec![SatTask::spawn("driver", async move {
            driver_shutdown.recv().await;
        })];

        shutdown.send();
        let result = try_join_tasks_and_shutdown(
            groups(supervisors, transport),
            eph_rx,
            shutdown,
            transport_shutdown.clone(),
            Duration::from_secs(1),
        )
        .await;

        match result {
            Err(Error::Hung { hung_tasks }) => {
                assert!(hung_tasks.contains(&"hangs forever".to_string()));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The transport was still told to stop.
        assert!(transport_shutdown.try_recv());
    }

    #[tokio::test]
    async fn ephemeral_tasks_may_finish_freely() {
        let shutdown = NotifyOnce::new();
        let transport_shutdown = NotifyOnce::new();
        let (eph_tx, eph_rx) = mpsc::channel(4);

        let mut supervisor_shutdown = shutdown.clone();
        let supervisors = vec![SatTask::spawn("supervisor", async move {
            supervisor_shutdown.recv().await;
        })];

        let joiner = tokio::spawn(try_join_tasks_and_shutdown(
            groups(supervisors, Vec::new()),
            eph_rx,
            shutdown.clone(),
            transport_shutdown,
            Duration::from_secs(1),
        ));

        // An ephemeral task finishing must not end the node.
        eph_tx
            .send(SatTask::spawn("one-off", async move {}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!joiner.is_finished());

        shutdown.send();
        joiner.await.unwrap().unwrap();
    }
}
