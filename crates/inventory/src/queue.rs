//! A per-node work queue.
//!
//! Each node key gets one worker fed through a latest-wins watch channel,
//! so duplicate enqueues coalesce and a key is reconciled by at most one
//! worker at a time. Requeue signals schedule a delayed re-run; errors back
//! off exponentially and reset on success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Error;
use crate::result::ReconcileResult;

const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(250);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Delay for a bare `requeue` without an explicit interval.
const REQUEUE_DELAY: Duration = Duration::from_millis(500);

/// The work a queue dispatches per key.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, node_name: &str) -> Result<ReconcileResult, Error>;
}

#[async_trait]
impl<T: Reconcile + ?Sized> Reconcile for Arc<T> {
    async fn reconcile(&self, node_name: &str) -> Result<ReconcileResult, Error> {
        (**self).reconcile(node_name).await
    }
}

pub struct NodeQueue<R> {
    reconciler: Arc<R>,
    workers: Mutex<HashMap<String, Worker>>,
}

struct Worker {
    sender: watch::Sender<u64>,
    _task: JoinHandle<()>,
}

impl<R: Reconcile> NodeQueue<R> {
    pub fn new(reconciler: Arc<R>) -> Self {
        NodeQueue {
            reconciler,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues a key. A second enqueue while the key is being worked
    /// coalesces with any pending one.
    pub async fn enqueue(&self, node_name: &str) {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .entry(node_name.to_string())
            .or_insert_with(|| Worker::spawn(node_name.to_string(), self.reconciler.clone()));
        let next = *worker.sender.borrow() + 1;
        if worker.sender.send(next).is_err() {
            // The worker exited; replace it and redeliver.
            let worker = Worker::spawn(node_name.to_string(), self.reconciler.clone());
            let _ = worker.sender.send(1);
            workers.insert(node_name.to_string(), worker);
        }
    }

    /// Stops every worker. Pending work is dropped.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for (_, worker) in workers.drain() {
            worker._task.abort();
        }
    }
}

impl Worker {
    fn spawn<R: Reconcile>(node_name: String, reconciler: Arc<R>) -> Self {
        let (sender, mut receiver) = watch::channel(0u64);
        let task = tokio::spawn(async move {
            let mut backoff = ERROR_BACKOFF_BASE;
            let mut deadline: Option<Instant> = None;
            loop {
                tokio::select! {
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        receiver.borrow_and_update();
                    }
                    _ = async { tokio::time::sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {}
                }
                deadline = None;
                match reconciler.reconcile(&node_name).await {
                    Ok(result) => {
                        backoff = ERROR_BACKOFF_BASE;
                        if let Some(delay) = result.requeue_after {
                            debug!(node = %node_name, ?delay, "requeueing after delay");
                            deadline = Some(Instant::now() + delay);
                        } else if result.requeue {
                            deadline = Some(Instant::now() + REQUEUE_DELAY);
                        }
                    }
                    Err(err) => {
                        warn!(node = %node_name, error = %err, "reconcile failed, backing off");
                        deadline = Some(Instant::now() + backoff);
                        backoff = (backoff * 2).min(ERROR_BACKOFF_MAX);
                    }
                }
            }
        });
        Worker {
            sender,
            _task: task,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        result: ReconcileResult,
        fail_first: AtomicUsize,
        work_duration: Duration,
    }

    impl Counting {
        fn new(result: ReconcileResult, failures: usize) -> Arc<Self> {
            Self::slow(result, failures, Duration::ZERO)
        }

        fn slow(result: ReconcileResult, failures: usize, work_duration: Duration) -> Arc<Self> {
            Arc::new(Counting {
                runs: AtomicUsize::new(0),
                result,
                fail_first: AtomicUsize::new(failures),
                work_duration,
            })
        }
    }

    #[async_trait]
    impl Reconcile for Counting {
        async fn reconcile(&self, _node_name: &str) -> Result<ReconcileResult, Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.work_duration.is_zero() {
                tokio::time::sleep(self.work_duration).await;
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Conflict("test".to_string()));
            }
            Ok(self.result)
        }
    }

    #[tokio::test]
    async fn enqueue_runs_reconciler() {
        let reconciler = Counting::new(ReconcileResult::default(), 0);
        let queue = NodeQueue::new(reconciler.clone());
        queue.enqueue("worker-a").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reconciler.runs.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn requeue_after_schedules_follow_up() {
        let reconciler = Counting::new(
            ReconcileResult::after(Duration::from_millis(50)),
            0,
        );
        let queue = NodeQueue::new(reconciler.clone());
        queue.enqueue("worker-a").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(reconciler.runs.load(Ordering::SeqCst) >= 2);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn errors_back_off_and_recover() {
        let reconciler = Counting::new(ReconcileResult::default(), 2);
        let queue = NodeQueue::new(reconciler.clone());
        queue.enqueue("worker-a").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Two failures, then a successful run with no requeue.
        assert_eq!(reconciler.runs.load(Ordering::SeqCst), 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_enqueues_coalesce() {
        let reconciler =
            Counting::slow(ReconcileResult::default(), 0, Duration::from_millis(100));
        let queue = NodeQueue::new(reconciler.clone());
        queue.enqueue("worker-a").await;
        // Let the first run get in flight, then pile up enqueues behind it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..4 {
            queue.enqueue("worker-a").await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        // One run in flight plus one coalesced follow-up.
        assert_eq!(reconciler.runs.load(Ordering::SeqCst), 2);
        queue.shutdown().await;
    }
}
