//! Supervised background tasks owned by an engine and joined on close.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

type Hook = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Background tasks of one engine (accept loop, frame loop, link, resends, hook runner).
/// Application handlers are not tracked here; closing never cancels them.
#[derive(Debug, Default)]
pub struct TaskSet {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    set: JoinSet<()>,
    closed: bool,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task. Returns false (and drops the future) once the set is shut down.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.closed {
            return false;
        }
        // Reap finished tasks so the set does not grow with every resend.
        while inner.set.try_join_next().is_some() {}
        inner.set.spawn(fut);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every task without waiting. Used from `Drop`.
    pub fn abort_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
            inner.set.abort_all();
        }
    }

    /// Abort every task and wait for all of them to finish. Idempotent.
    pub async fn shutdown(&self) {
        let mut set = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.closed = true;
            std::mem::take(&mut inner.set)
        };
        set.abort_all();
        let mut joined = 0usize;
        while set.join_next().await.is_some() {
            joined += 1;
        }
        debug!(joined, "background tasks stopped");
    }
}

/// Application callbacks of one engine, run one at a time in the order they were queued.
/// The runner lives in the engine's `TaskSet`, so callbacks still queued at close are dropped.
#[derive(Clone)]
pub struct HookQueue {
    tx: mpsc::UnboundedSender<Hook>,
}

impl HookQueue {
    pub fn start(tasks: &TaskSet) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Hook>();
        tasks.spawn(async move {
            while let Some(hook) = rx.recv().await {
                hook.await;
            }
        });
        Self { tx }
    }

    pub fn push<F>(&self, hook: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(hook)).is_err() {
            debug!("hook runner stopped, callback dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_aborts_and_refuses_new_work() {
        let tasks = TaskSet::new();
        assert!(tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        assert_eq!(tasks.len(), 1);
        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown())
            .await
            .unwrap();
        assert!(tasks.is_empty());
        assert!(!tasks.spawn(async {}));
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn hooks_run_in_queue_order() {
        let tasks = TaskSet::new();
        let hooks = HookQueue::start(&tasks);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..5u64 {
            let tx = tx.clone();
            hooks.push(async move {
                // Earlier hooks sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
                let _ = tx.send(i);
            });
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        tasks.shutdown().await;
        // Runner is gone; pushing is a no-op.
        hooks.push(async {});
    }

    #[tokio::test]
    async fn finished_tasks_are_reaped() {
        let tasks = TaskSet::new();
        tasks.spawn(async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(tasks.len(), 1);
        tasks.shutdown().await;
    }
}
