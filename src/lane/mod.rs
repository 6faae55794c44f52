//! Lane strategies: the two interchangeable cores that order tasks per key.

pub(crate) mod chained;
pub(crate) mod pooled;

use crate::error::SequencerError;
use crate::task::{ResultSender, TaskFuture};

/// Selects how lanes order their tasks. Both strategies uphold the same
/// contract; the trade-off is purely structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaneStrategy {
  /// Each lane is a chain of completion stages; the registry stores only the
  /// tail stage. Cheapest bookkeeping, one allocation per append.
  #[default]
  ChainedStages,
  /// Each lane borrows a single-consumer worker from a shared pool; the
  /// registry stores the worker and its exact pending-task counter. Workers
  /// are reused across keys over time.
  PooledWorkers,
}

/// The contract every lane strategy implements.
///
/// `append` is atomic per key and non-blocking: the caller returns as soon as
/// the append is recorded, never waiting on execution. While a lane holds any
/// unfinished task it stays reachable in the registry; once it drains, the
/// strategy's sweep removes it.
pub(crate) trait LaneCore<K, R: Send + 'static>: Send + Sync {
  /// Appends `task` to the lane for `key`, creating the lane if absent.
  /// Returns the new stage's id. Fails only when the sequencer no longer
  /// accepts submissions.
  fn append(
    &self,
    key: K,
    task: TaskFuture<R>,
    result_tx: Option<ResultSender<R>>,
  ) -> Result<u64, SequencerError>;

  /// Number of keys with an in-service lane right now.
  fn active_lane_count(&self) -> usize;
}
