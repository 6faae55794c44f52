use thiserror::Error;

/// Errors surfaced by the `keylane` sequencer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SequencerError {
  #[error("sequencer is shutting down or closed, cannot accept new tasks")]
  Shutdown,

  #[error(
    "shutdown not supported on a per-key executor: the shared pool may be running tasks for \
     unrelated sequence keys, and shutting it down would cancel work owned by others; close the \
     factory instead"
  )]
  ShutdownUnsupported,

  #[error("submitted task panicked during execution")]
  TaskPanicked,

  #[error("task result channel closed before a result was delivered: {0}")]
  ResultChannelError(String),

  #[error("no tasks were supplied")]
  NoTasks,

  #[error("every supplied task failed")]
  AllTasksFailed,

  #[error("max concurrency must be a positive integer, got {0}")]
  InvalidMaxConcurrency(usize),
}
