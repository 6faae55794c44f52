use crate::dispatch::Dispatcher;
use crate::error::SequencerError;
use crate::lane::LaneCore;
use crate::registry::{LaneRegistry, LaneUpdate};
use crate::task::{next_stage_id, ResultSender, TaskFuture};

use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info_span, trace, warn, Instrument};

/// One unit of lane work: the task plus the completion listener that runs the
/// sweep after it.
struct WorkItem<R: Send + 'static> {
  stage_id: u64,
  task: TaskFuture<R>,
  result_tx: Option<ResultSender<R>>,
  after_run: Box<dyn FnOnce() + Send + 'static>,
}

/// The registry value under the pooled-worker strategy: the borrowed worker
/// currently serving the lane.
///
/// `pending` is exact, not approximate: it is only mutated and only read for
/// sweep decisions while the per-key registry lock is held, except for the
/// worker loop's decrement, which happens before the loop invokes the sweep
/// and is therefore ordered before the sweep's read.
pub(crate) struct WorkerHandle<R: Send + 'static> {
  worker_id: u64,
  queue_tx: UnboundedSender<WorkItem<R>>,
  pending: Arc<AtomicUsize>,
}

impl<R: Send + 'static> Clone for WorkerHandle<R> {
  fn clone(&self) -> Self {
    Self {
      worker_id: self.worker_id,
      queue_tx: self.queue_tx.clone(),
      pending: self.pending.clone(),
    }
  }
}

/// Shared pool of interchangeable single-consumer workers. A worker serves
/// one key at a time; over its lifetime it may serve many. Its queue is
/// always empty when it sits in the pool.
pub(crate) struct WorkerPool<R: Send + 'static> {
  idle: Mutex<Vec<WorkerHandle<R>>>,
  next_worker_id: AtomicU64,
  dispatcher: Arc<Dispatcher>,
}

impl<R: Send + 'static> WorkerPool<R> {
  pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
    let pool = Arc::new(Self {
      idle: Mutex::new(Vec::new()),
      next_worker_id: AtomicU64::new(0),
      dispatcher: dispatcher.clone(),
    });
    // Idle workers park on their queues; release them once the sequencer has
    // fully terminated so their loops can exit.
    let janitor_pool = pool.clone();
    dispatcher.spawn(async move {
      janitor_pool.dispatcher.wait_terminated().await;
      let released = janitor_pool.idle.lock().drain(..).count();
      debug!(workers = released, "released idle lane workers after termination");
    });
    pool
  }

  /// Pops an idle worker, or creates one and spawns its consumer loop.
  pub(crate) fn borrow(&self) -> WorkerHandle<R> {
    if let Some(worker) = self.idle.lock().pop() {
      trace!(worker_id = worker.worker_id, "borrowed idle lane worker");
      return worker;
    }
    let worker_id = self.next_worker_id.fetch_add(1, AtomicOrdering::Relaxed);
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let span = info_span!("lane_worker", sequencer = %self.dispatcher.name(), worker_id);
    self
      .dispatcher
      .spawn(run_worker_loop(queue_rx, pending.clone(), self.dispatcher.clone()).instrument(span));
    debug!(worker_id, "created lane worker");
    WorkerHandle {
      worker_id,
      queue_tx,
      pending,
    }
  }

  /// Returns a drained worker to the pool. A worker that cannot be pooled is
  /// abandoned with a warning; the pool re-creates on demand.
  pub(crate) fn give_back(&self, worker: WorkerHandle<R>) {
    if worker.queue_tx.is_closed() {
      warn!(
        worker_id = worker.worker_id,
        "cannot return lane worker to the pool, its queue is closed; abandoning it"
      );
      return;
    }
    let backlog = worker.pending.load(AtomicOrdering::Acquire);
    if backlog != 0 {
      warn!(
        worker_id = worker.worker_id,
        backlog, "refusing to pool a lane worker with queued tasks; abandoning it"
      );
      return;
    }
    if self.dispatcher.is_shutdown() {
      debug!(
        worker_id = worker.worker_id,
        "sequencer shutting down, releasing lane worker instead of pooling"
      );
      return;
    }
    trace!(worker_id = worker.worker_id, "returned lane worker to the pool");
    self.idle.lock().push(worker);
  }

  #[cfg(test)]
  fn idle_count(&self) -> usize {
    self.idle.lock().len()
  }
}

/// Consumes a worker's queue until every sender (registry entry or pool
/// slot) is gone.
async fn run_worker_loop<R: Send + 'static>(
  mut queue_rx: UnboundedReceiver<WorkItem<R>>,
  pending: Arc<AtomicUsize>,
  dispatcher: Arc<Dispatcher>,
) {
  debug!("lane worker loop started");
  while let Some(item) = queue_rx.recv().await {
    let WorkItem {
      stage_id,
      task,
      result_tx,
      after_run,
    } = item;

    let outcome: Result<R, SequencerError> = match dispatcher.acquire_slot().await {
      Ok(_slot) => match AssertUnwindSafe(task).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(_panic_payload) => {
          warn!(stage_id, "task panicked during execution");
          Err(SequencerError::TaskPanicked)
        }
      },
      Err(_) => Err(SequencerError::Shutdown),
    };

    if let Some(tx) = result_tx {
      if tx.send(outcome).is_err() {
        trace!(stage_id, "ticket dropped before result delivery");
      }
    }

    // Decrement before the sweep so the count it reads under the per-key
    // lock already excludes this item.
    pending.fetch_sub(1, AtomicOrdering::AcqRel);
    after_run();
    dispatcher.task_finished();
  }
  debug!("lane worker loop stopped");
}

/// Lane core where each lane borrows a single-consumer worker from a shared
/// pool for as long as it has pending work.
pub(crate) struct PooledLanes<K, R: Send + 'static> {
  registry: LaneRegistry<K, WorkerHandle<R>>,
  pool: Arc<WorkerPool<R>>,
  dispatcher: Arc<Dispatcher>,
}

impl<K, R> PooledLanes<K, R>
where
  K: Hash + Eq + Clone + Send + Sync + 'static,
  R: Send + 'static,
{
  pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
    Self {
      registry: LaneRegistry::new(),
      pool: WorkerPool::new(dispatcher.clone()),
      dispatcher,
    }
  }

  /// The sweep listener invoked by the worker loop after each task: return
  /// the worker and drop the lane iff the exact pending count is zero.
  fn sweep_listener(&self, key: K) -> Box<dyn FnOnce() + Send + 'static> {
    let registry = self.registry.clone();
    let pool = self.pool.clone();
    Box::new(move || {
      let swept = registry.update(key, |slot| match slot {
        None => {
          debug!("lane already swept by another completion");
          (LaneUpdate::Keep, None)
        }
        Some(worker) => {
          let backlog = worker.pending.load(AtomicOrdering::Acquire);
          if backlog == 0 {
            trace!(worker_id = worker.worker_id, "sweeping drained lane off the registry");
            (LaneUpdate::Remove, Some(worker.clone()))
          } else {
            trace!(worker_id = worker.worker_id, backlog, "keeping lane in service");
            (LaneUpdate::Keep, None)
          }
        }
      });
      if let Some(worker) = swept {
        pool.give_back(worker);
      }
    })
  }
}

impl<K, R> LaneCore<K, R> for PooledLanes<K, R>
where
  K: Hash + Eq + Clone + Send + Sync + 'static,
  R: Send + 'static,
{
  fn append(
    &self,
    key: K,
    task: TaskFuture<R>,
    result_tx: Option<ResultSender<R>>,
  ) -> Result<u64, SequencerError> {
    if self.dispatcher.is_shutdown() {
      return Err(SequencerError::Shutdown);
    }

    let stage_id = next_stage_id();
    let item = WorkItem {
      stage_id,
      task,
      result_tx,
      after_run: self.sweep_listener(key.clone()),
    };

    self.dispatcher.task_started();
    let pool = self.pool.clone();
    let enqueued = self.registry.update(key, move |slot| match slot {
      Some(worker) => {
        // Increment before the send: once the item is in the queue the
        // worker may finish it at any moment.
        worker.pending.fetch_add(1, AtomicOrdering::AcqRel);
        match worker.queue_tx.send(item) {
          Ok(()) => (LaneUpdate::Keep, Ok(())),
          Err(_) => {
            worker.pending.fetch_sub(1, AtomicOrdering::AcqRel);
            warn!(
              worker_id = worker.worker_id,
              stage_id, "lane worker queue closed, dropping the lane"
            );
            (LaneUpdate::Remove, Err(SequencerError::Shutdown))
          }
        }
      }
      None => {
        let worker = pool.borrow();
        worker.pending.store(1, AtomicOrdering::Release);
        match worker.queue_tx.send(item) {
          Ok(()) => {
            trace!(worker_id = worker.worker_id, stage_id, "created lane on borrowed worker");
            (LaneUpdate::Install(worker), Ok(()))
          }
          Err(_) => {
            warn!(
              worker_id = worker.worker_id,
              stage_id, "freshly borrowed lane worker rejected its first task"
            );
            (LaneUpdate::Keep, Err(SequencerError::Shutdown))
          }
        }
      }
    });

    match enqueued {
      Ok(()) => Ok(stage_id),
      Err(error) => {
        self.dispatcher.task_finished();
        Err(error)
      }
    }
  }

  fn active_lane_count(&self) -> usize {
    self.registry.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_dispatcher() -> Arc<Dispatcher> {
    Dispatcher::new("pool_tests", 4, tokio::runtime::Handle::current())
  }

  #[tokio::test]
  async fn borrow_creates_distinct_workers() {
    let pool: Arc<WorkerPool<()>> = WorkerPool::new(test_dispatcher());
    let a = pool.borrow();
    let b = pool.borrow();
    assert_ne!(a.worker_id, b.worker_id);
  }

  #[tokio::test]
  async fn returned_worker_is_reused() {
    let pool: Arc<WorkerPool<()>> = WorkerPool::new(test_dispatcher());
    let first = pool.borrow();
    let first_id = first.worker_id;
    pool.give_back(first);
    assert_eq!(pool.idle_count(), 1);
    let again = pool.borrow();
    assert_eq!(again.worker_id, first_id);
    assert_eq!(pool.idle_count(), 0);
  }

  #[tokio::test]
  async fn worker_with_backlog_is_abandoned() {
    let pool: Arc<WorkerPool<()>> = WorkerPool::new(test_dispatcher());
    let worker = pool.borrow();
    worker.pending.store(2, AtomicOrdering::Release);
    pool.give_back(worker);
    assert_eq!(pool.idle_count(), 0);
  }

  #[tokio::test]
  async fn no_pooling_after_shutdown() {
    let dispatcher = test_dispatcher();
    let pool: Arc<WorkerPool<()>> = WorkerPool::new(dispatcher.clone());
    let worker = pool.borrow();
    dispatcher.signal_shutdown();
    pool.give_back(worker);
    assert_eq!(pool.idle_count(), 0);
  }
}
