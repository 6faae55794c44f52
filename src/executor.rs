use crate::dispatch::Dispatcher;
use crate::error::SequencerError;
use crate::lane::LaneCore;
use crate::task::TaskFuture;
use crate::ticket::TaskTicket;

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

/// A per-key executor handle minted by
/// [`SequencerFactory::handle`](crate::SequencerFactory::handle).
///
/// Every submission through any handle for an equal key serializes on that
/// key's lane. The handle forwards submissions and inspection to the shared
/// pool but refuses the shutdown family: the pool may be running tasks for
/// unrelated sequence keys, so tearing it down belongs to the factory alone.
pub struct KeyedExecutor<K: 'static, R: Send + 'static> {
  key: K,
  core: Arc<dyn LaneCore<K, R>>,
  dispatcher: Arc<Dispatcher>,
}

impl<K: Clone + 'static, R: Send + 'static> Clone for KeyedExecutor<K, R> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      core: self.core.clone(),
      dispatcher: self.dispatcher.clone(),
    }
  }
}

impl<K, R> KeyedExecutor<K, R>
where
  K: Clone + Send + Sync + 'static,
  R: Send + 'static,
{
  pub(crate) fn new(key: K, core: Arc<dyn LaneCore<K, R>>, dispatcher: Arc<Dispatcher>) -> Self {
    Self { key, core, dispatcher }
  }

  /// The sequence key this handle submits under.
  pub fn key(&self) -> &K {
    &self.key
  }

  /// Fire-and-forget submission. The task is appended to this key's lane and
  /// its outcome is discarded; a panicking task is logged at warn level and
  /// does not poison the lane.
  pub fn execute(&self, task: TaskFuture<R>) -> Result<(), SequencerError> {
    self.core.append(self.key.clone(), task, None).map(|_| ())
  }

  /// Appends `task` to this key's lane and returns a ticket for its outcome.
  ///
  /// Submission is non-blocking: it returns as soon as the append is
  /// recorded, regardless of how much work is queued ahead.
  pub fn submit(&self, task: TaskFuture<R>) -> Result<TaskTicket<R>, SequencerError> {
    let (result_tx, result_rx) = oneshot::channel();
    let stage_id = self.core.append(self.key.clone(), task, Some(result_tx))?;
    debug!(stage_id, "task accepted");
    Ok(TaskTicket { stage_id, result_rx })
  }

  /// Submits every task in order under this key and awaits all outcomes.
  /// The outcomes come back in submission order; per-key serialization is
  /// preserved across the whole batch.
  pub async fn invoke_all(
    &self,
    tasks: Vec<TaskFuture<R>>,
  ) -> Result<Vec<Result<R, SequencerError>>, SequencerError> {
    let mut tickets = Vec::with_capacity(tasks.len());
    for task in tasks {
      tickets.push(self.submit(task)?);
    }
    let mut outcomes = Vec::with_capacity(tickets.len());
    for ticket in tickets {
      outcomes.push(ticket.await_result().await);
    }
    Ok(outcomes)
  }

  /// Submits every task in order under this key and returns the first
  /// successful outcome in submission order. Later tasks still run; accepted
  /// work is never cancelled.
  pub async fn invoke_any(&self, tasks: Vec<TaskFuture<R>>) -> Result<R, SequencerError> {
    if tasks.is_empty() {
      return Err(SequencerError::NoTasks);
    }
    let mut tickets = Vec::with_capacity(tasks.len());
    for task in tasks {
      tickets.push(self.submit(task)?);
    }
    for ticket in tickets {
      if let Ok(value) = ticket.await_result().await {
        return Ok(value);
      }
    }
    Err(SequencerError::AllTasksFailed)
  }

  /// Always fails with [`SequencerError::ShutdownUnsupported`] and alters no
  /// state. Close the owning factory to shut the pool down.
  pub fn shutdown(&self) -> Result<(), SequencerError> {
    Err(SequencerError::ShutdownUnsupported)
  }

  /// See [`shutdown`](Self::shutdown).
  pub fn shutdown_now(&self) -> Result<(), SequencerError> {
    Err(SequencerError::ShutdownUnsupported)
  }

  /// Whether the shared pool has stopped accepting submissions.
  pub fn is_shutdown(&self) -> bool {
    self.dispatcher.is_shutdown()
  }

  /// Whether the shared pool has stopped and drained all accepted work.
  pub fn is_terminated(&self) -> bool {
    self.dispatcher.is_terminated()
  }

  /// Waits until the shared pool is shut down and drained. Callers wanting a
  /// bound wrap this in their own timeout.
  pub async fn await_termination(&self) {
    self.dispatcher.wait_terminated().await;
  }
}
