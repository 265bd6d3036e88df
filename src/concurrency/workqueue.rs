//! Bounded worker pool for registry work
//!
//! A [`WorkQueue`] owns a fixed number of tokio tasks that drain one
//! unbounded channel. Each submitted unit carries a completion guard, so a
//! waiter is released whether the unit ran, failed, or was dropped after
//! the stop signal fired.

use crate::error::{RegistryError, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc, watch};

/// Counts outstanding units; waiters wake when it reaches zero
#[derive(Clone, Default)]
struct WaitGroup {
    inner: Arc<WaitInner>,
}

#[derive(Default)]
struct WaitInner {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    fn add(&self) -> CompletionGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        CompletionGuard {
            inner: self.inner.clone(),
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct CompletionGuard {
    inner: Arc<WaitInner>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

struct Unit {
    job: BoxFuture<'static, ()>,
    _guard: CompletionGuard,
}

/// Resolves once `stop` is set; never resolves if the sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<Unit>,
    workers: usize,
    queued: WaitGroup,
}

impl WorkQueue {
    /// Start `workers` tasks (at least one) that run until `stop` is set
    pub fn new(workers: usize, stop: watch::Receiver<bool>) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Unit>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for _ in 0..workers {
            let receiver = receiver.clone();
            let mut stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    let unit = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            unit = receiver.recv() => unit,
                            _ = stopped(&mut stop) => None,
                        }
                    };
                    let Some(unit) = unit else { break };
                    if *stop.borrow() {
                        break;
                    }
                    unit.job.await;
                }
            });
        }

        Self {
            sender,
            workers,
            queued: WaitGroup::default(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn submit(&self, group: &WaitGroup, job: BoxFuture<'static, ()>) {
        let unit = Unit {
            job,
            _guard: group.add(),
        };
        // A closed queue drops the unit, which releases its guard
        if self.sender.send(unit).is_err() {
            tracing::trace!("work queue stopped, dropping unit");
        }
    }

    /// Run every unit submitted by `f` and wait for all of them
    pub async fn batch<F>(&self, f: F)
    where
        F: FnOnce(&mut Batch<'_>),
    {
        let mut batch = Batch {
            queue: self,
            group: WaitGroup::default(),
        };
        f(&mut batch);
        batch.group.wait().await;
    }

    /// Like [`batch`](Self::batch), returning the first error reported by
    /// any unit after all units have finished
    pub async fn try_batch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut TryBatch<'_>),
    {
        let mut batch = TryBatch {
            queue: self,
            group: WaitGroup::default(),
            first_error: Arc::new(Mutex::new(None)),
        };
        f(&mut batch);
        batch.group.wait().await;
        let first = batch
            .first_error
            .lock()
            .map_err(|_| RegistryError::Io("work queue error slot poisoned".to_string()))?
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Submit a unit without waiting; see [`done`](Self::done)
    pub fn queue<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.submit(&self.queued, Box::pin(fut));
    }

    /// Wait for every unit submitted through [`queue`](Self::queue)
    pub async fn done(&self) {
        self.queued.wait().await;
    }
}

pub struct Batch<'a> {
    queue: &'a WorkQueue,
    group: WaitGroup,
}

impl Batch<'_> {
    pub fn work<Fut>(&mut self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.queue.submit(&self.group, Box::pin(fut));
    }
}

pub struct TryBatch<'a> {
    queue: &'a WorkQueue,
    group: WaitGroup,
    first_error: Arc<Mutex<Option<RegistryError>>>,
}

impl TryBatch<'_> {
    pub fn try_work<Fut>(&mut self, fut: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut outcome = UnitOutcome {
            slot: self.first_error.clone(),
            finished: false,
        };
        self.queue.submit(
            &self.group,
            Box::pin(async move {
                let result = fut.await;
                outcome.finished = true;
                if let Err(err) = result {
                    outcome.record(err);
                }
            }),
        );
    }
}

/// Reports a unit that was dropped before it finished as cancelled
struct UnitOutcome {
    slot: Arc<Mutex<Option<RegistryError>>>,
    finished: bool,
}

impl UnitOutcome {
    fn record(&self, err: RegistryError) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.get_or_insert(err);
        }
    }
}

impl Drop for UnitOutcome {
    fn drop(&mut self) {
        if !self.finished {
            self.record(RegistryError::Cancelled("work stopped before the unit ran".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_worker_count() {
        let (_stop_tx, stop) = watch::channel(false);
        let queue = WorkQueue::new(3, stop);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        queue
            .batch(|w| {
                for _ in 0..100 {
                    let active = active.clone();
                    let peak = peak.clone();
                    let finished = finished.clone();
                    w.work(async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        finished.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
            .await;

        assert_eq!(finished.load(Ordering::SeqCst), 100);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn try_batch_reports_first_error_after_all_units_finish() {
        let (_stop_tx, stop) = watch::channel(false);
        let queue = WorkQueue::new(2, stop);
        let finished = Arc::new(AtomicUsize::new(0));

        let result = queue
            .try_batch(|w| {
                for i in 0..10 {
                    let finished = finished.clone();
                    w.try_work(async move {
                        finished.fetch_add(1, Ordering::SeqCst);
                        if i == 4 {
                            return Err(RegistryError::Validation("unit 4 failed".to_string()));
                        }
                        Ok(())
                    });
                }
            })
            .await;

        assert!(matches!(result, Err(RegistryError::Validation(_))));
        assert_eq!(finished.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn try_batch_fails_when_stopped_units_never_run() {
        let (stop_tx, stop) = watch::channel(false);
        let queue = WorkQueue::new(2, stop);
        stop_tx.send(true).unwrap();
        tokio::task::yield_now().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            queue.try_batch(|w| {
                for _ in 0..4 {
                    let ran = ran.clone();
                    w.try_work(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                }
            }),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(RegistryError::Cancelled(_))));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn queued_units_release_waiters_after_stop() {
        let (stop_tx, stop) = watch::channel(false);
        let queue = WorkQueue::new(1, stop);
        stop_tx.send(true).unwrap();
        tokio::task::yield_now().await;

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = ran.clone();
            queue.queue(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::timeout(Duration::from_secs(5), queue.done())
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
