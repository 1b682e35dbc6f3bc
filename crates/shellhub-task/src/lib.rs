//! Cooperative task framework shared by the gateway and the agent.
//!
//! Long-lived loops (listeners, tunnel keepalives, sweepers…) implement
//! [`Task`]; [`spawn_task`] runs them inside a tracing span carrying the
//! task name and hands back an abort-on-drop handle.
//!
//! Shutdown is a level-triggered broadcast: a signal raised before a task
//! starts waiting is still observed.

use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::Instrument as _;

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: tokio::sync::watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Raises the shutdown flag for every associated [`ShutdownSignal`].
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    /// Resolves once every associated [`ShutdownSignal`] is dropped.
    pub async fn all_closed(&self) {
        self.tx.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: tokio::sync::watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown is requested, including when the request
    /// predates the call.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // The handle is gone; nobody can signal anymore.
                break;
            }
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Handle over a spawned task.
///
/// Dropping the handle aborts the task; see
/// https://github.com/tokio-rs/tokio/issues/1830 for some background.
/// [`TaskHandle::detach`] opts out of the supervision instead.
#[must_use]
pub struct TaskHandle<T> {
    name: &'static str,
    inner: Option<JoinHandle<T>>,
}

impl<T> TaskHandle<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self {
            name: "anonymous",
            inner: Some(tokio::task::spawn(future)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        let handle = self.inner.take().expect("a handle is only emptied by detach, which consumes it");
        handle.await
    }

    /// Aborts the task immediately.
    pub fn abort(&self) {
        if let Some(handle) = &self.inner {
            handle.abort();
        }
    }

    /// Lets the task run to completion unsupervised.
    pub fn detach(mut self) {
        self.inner.take();
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.inner {
            tracing::trace!(task = self.name, "Aborting task");
            handle.abort();
        }
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

/// Spawns a task under a span named after it, so every log line the task
/// emits is attributed.
pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> TaskHandle<T::Output>
where
    T: Task + Send + 'static,
{
    let span = tracing::info_span!("task", name = T::NAME);

    let future = async move {
        tracing::trace!("Task spawned");
        task.run(shutdown_signal).await
    }
    .instrument(span);

    TaskHandle {
        name: T::NAME,
        inner: Some(tokio::task::spawn(future)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct WaitForShutdown;

    #[async_trait]
    impl Task for WaitForShutdown {
        type Output = &'static str;

        const NAME: &'static str = "wait for shutdown";

        async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
            shutdown_signal.wait().await;
            "stopped"
        }
    }

    #[tokio::test]
    async fn shutdown_signal_is_broadcast() {
        let (handle, signal) = shutdown_channel();

        let first = spawn_task(WaitForShutdown, signal.clone());
        let second = spawn_task(WaitForShutdown, signal);

        handle.signal();

        assert_eq!(first.join().await.unwrap(), "stopped");
        assert_eq!(second.join().await.unwrap(), "stopped");

        handle.all_closed().await;
    }

    #[tokio::test]
    async fn shutdown_is_level_triggered() {
        let (handle, signal) = shutdown_channel();

        // The signal is raised before anyone waits on it.
        handle.signal();
        assert!(signal.is_signaled());

        let late = spawn_task(WaitForShutdown, signal);
        assert_eq!(late.join().await.unwrap(), "stopped");
    }

    #[tokio::test]
    async fn task_handle_aborts_on_drop() {
        let task = TaskHandle::spawn(std::future::pending::<()>());
        let inner = task.inner.as_ref().unwrap().abort_handle();
        drop(task);

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !inner.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("task should be aborted promptly");
    }

    #[tokio::test]
    async fn detached_tasks_keep_running() {
        let (tx, rx) = tokio::sync::oneshot::channel();

        let task = TaskHandle::spawn(async move {
            let _ = tx.send(());
        });
        task.detach();

        rx.await.expect("detached task should still complete");
    }
}
