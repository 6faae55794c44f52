use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{AcquireError, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared execution state behind every lane: the Tokio handle all stages are
/// spawned on, the semaphore bounding global parallelism, and the shutdown
/// lifecycle of the factory that owns it.
///
/// Lanes impose ordering only; the dispatcher owns the threads. Successive
/// stages of one lane may land on different runtime threads, which is fine as
/// long as each stage starts only after its predecessor's completion.
pub(crate) struct Dispatcher {
  name: Arc<String>,
  tokio_handle: TokioHandle,
  slots: Arc<Semaphore>,
  shutdown_token: CancellationToken,
  pending: AtomicUsize,
  idle: Notify,
}

impl Dispatcher {
  pub(crate) fn new(name: &str, pool_size: usize, tokio_handle: TokioHandle) -> Arc<Self> {
    let dispatcher = Arc::new(Self {
      name: Arc::new(name.to_string()),
      tokio_handle,
      slots: Arc::new(Semaphore::new(pool_size.max(1))),
      shutdown_token: CancellationToken::new(),
      pending: AtomicUsize::new(0),
      idle: Notify::new(),
    });
    debug!(sequencer = %dispatcher.name, pool_size = pool_size.max(1), "dispatcher constructed");
    dispatcher
  }

  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
    self.tokio_handle.spawn(fut);
  }

  /// Acquires one execution slot. Stages call this after their predecessor
  /// has completed, never before, so a full pool cannot deadlock a chain of
  /// waiting successors.
  pub(crate) async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
    self.slots.clone().acquire_owned().await
  }

  /// Records one accepted submission. Balanced by [`task_finished`] once the
  /// stage has fully retired, sweep included.
  pub(crate) fn task_started(&self) {
    self.pending.fetch_add(1, AtomicOrdering::AcqRel);
  }

  pub(crate) fn task_finished(&self) {
    if self.pending.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
      self.idle.notify_waiters();
    }
  }

  pub(crate) fn pending_count(&self) -> usize {
    self.pending.load(AtomicOrdering::Acquire)
  }

  pub(crate) fn is_shutdown(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  pub(crate) fn is_terminated(&self) -> bool {
    self.is_shutdown() && self.pending_count() == 0
  }

  pub(crate) async fn cancelled(&self) {
    self.shutdown_token.cancelled().await;
  }

  /// Stops admission of new work. Already accepted stages, queued successors
  /// included, still run to completion.
  pub(crate) fn signal_shutdown(&self) {
    if !self.shutdown_token.is_cancelled() {
      info!(sequencer = %self.name, "shutdown signalled, no further submissions accepted");
      self.shutdown_token.cancel();
    }
  }

  /// Waits until every accepted stage has fully retired.
  pub(crate) async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.pending_count() == 0 {
        return;
      }
      notified.await;
    }
  }

  /// Waits for shutdown to be signalled and all accepted work to drain.
  pub(crate) async fn wait_terminated(&self) {
    self.cancelled().await;
    self.wait_idle().await;
  }

  /// Graceful close: reject new submissions, drain everything accepted.
  pub(crate) async fn close(&self) {
    self.signal_shutdown();
    self.wait_idle().await;
    info!(sequencer = %self.name, "dispatcher drained and terminated");
  }
}
