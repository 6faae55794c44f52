use crate::error::SequencerError;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::oneshot;

/// The type of future the sequencer executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskFuture<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// Sending half of a caller's result channel. `None` for fire-and-forget
/// submissions.
pub(crate) type ResultSender<R> = oneshot::Sender<Result<R, SequencerError>>;

lazy_static::lazy_static! {
  static ref NEXT_STAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Returns a process-unique id for a newly appended stage.
pub(crate) fn next_stage_id() -> u64 {
  NEXT_STAGE_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// What a finished stage hands to the stage chained behind it.
///
/// A panicking predecessor does not cancel its successor; the successor only
/// logs the report before running its own task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageReport {
  pub(crate) stage_id: u64,
  pub(crate) panicked: bool,
}
