use crate::error::SequencerError;

use tokio::sync::oneshot;
use tracing::warn;

/// A handle to a task accepted by a [`KeyedExecutor`](crate::KeyedExecutor).
///
/// Awaiting the ticket yields the task's outcome. Dropping the ticket does
/// not cancel the task: the task still runs to completion and still gates
/// the successors queued behind it under the same sequence key.
#[derive(Debug)]
pub struct TaskTicket<R: Send + 'static> {
  pub(crate) stage_id: u64,
  pub(crate) result_rx: oneshot::Receiver<Result<R, SequencerError>>,
}

impl<R: Send + 'static> TaskTicket<R> {
  /// Returns the unique id of the underlying stage.
  pub fn id(&self) -> u64 {
    self.stage_id
  }

  /// Awaits the completion of the task and returns its outcome.
  ///
  /// # Errors
  /// Returns `SequencerError::TaskPanicked` if the task panicked,
  /// `SequencerError::Shutdown` if the pool was torn down before the task
  /// could run, or `SequencerError::ResultChannelError` if the result channel
  /// broke before a result was delivered.
  pub async fn await_result(self) -> Result<R, SequencerError> {
    match self.result_rx.await {
      Ok(outcome) => outcome,
      Err(recv_error) => {
        warn!(stage_id = %self.stage_id, "result channel receive error: {}", recv_error);
        Err(SequencerError::ResultChannelError(format!(
          "stage {} result channel unexpectedly closed: {}",
          self.stage_id, recv_error
        )))
      }
    }
  }
}
