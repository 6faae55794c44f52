use crate::dispatch::Dispatcher;
use crate::error::SequencerError;
use crate::lane::LaneCore;
use crate::registry::{LaneRegistry, LaneUpdate};
use crate::task::{next_stage_id, ResultSender, StageReport, TaskFuture};

use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{info_span, trace, warn, Instrument};

/// The registry value under the chained-stage strategy: the most recently
/// appended stage of the lane.
///
/// `handoff` is the receiving half of this stage's completion report. The
/// next append takes it, so exactly one successor ever chains behind a given
/// stage; once taken, this stage is no longer the tail.
struct TailStage {
  stage_id: u64,
  done: Arc<AtomicBool>,
  handoff: Option<oneshot::Receiver<StageReport>>,
}

/// Lane core where each lane is a chain of completion stages and the
/// registry stores only the tail.
pub(crate) struct ChainedLanes<K, R: Send + 'static> {
  registry: LaneRegistry<K, TailStage>,
  dispatcher: Arc<Dispatcher>,
  _result: PhantomData<fn() -> R>,
}

impl<K, R> ChainedLanes<K, R>
where
  K: Hash + Eq + Clone + Send + Sync + 'static,
  R: Send + 'static,
{
  pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Self {
    Self {
      registry: LaneRegistry::new(),
      dispatcher,
      _result: PhantomData,
    }
  }
}

impl<K, R> LaneCore<K, R> for ChainedLanes<K, R>
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
    let done = Arc::new(AtomicBool::new(false));
    let (handoff_tx, handoff_rx) = oneshot::channel::<StageReport>();

    self.dispatcher.task_started();

    // Atomic per-key update: take the current tail's handoff (if any) and
    // store the new stage as the tail. The taken receiver is what chains the
    // new stage behind its predecessor.
    let tail_done = done.clone();
    let predecessor = self.registry.update(key.clone(), move |slot| {
      let next_tail = TailStage {
        stage_id,
        done: tail_done,
        handoff: Some(handoff_rx),
      };
      match slot {
        None => (LaneUpdate::Install(next_tail), None),
        Some(tail) => {
          let prev = tail.handoff.take();
          *tail = next_tail;
          (LaneUpdate::Keep, prev)
        }
      }
    });
    if predecessor.is_none() {
      trace!(stage_id, "created lane, stage is both head and tail");
    }

    let dispatcher = self.dispatcher.clone();
    let registry = self.registry.clone();
    let span = info_span!("sequenced_stage", sequencer = %self.dispatcher.name(), stage_id);
    let stage = async move {
      if let Some(prev_rx) = predecessor {
        match prev_rx.await {
          Ok(report) if report.panicked => {
            warn!(
              predecessor_stage = report.stage_id,
              "predecessor stage panicked, running this task anyway"
            );
          }
          Ok(_) => {}
          // A stage always reports before retiring; a closed handoff means
          // the runtime tore the predecessor down mid-flight.
          Err(_) => trace!("predecessor handoff closed without a report"),
        }
      }

      let outcome: Result<R, SequencerError> = match dispatcher.acquire_slot().await {
        Ok(_slot) => match AssertUnwindSafe(task).catch_unwind().await {
          Ok(value) => Ok(value),
          Err(_panic_payload) => {
            warn!("task panicked during execution");
            Err(SequencerError::TaskPanicked)
          }
        },
        Err(_) => Err(SequencerError::Shutdown),
      };
      let panicked = matches!(outcome, Err(SequencerError::TaskPanicked));

      // The caller's ticket resolves before the lane is allowed to advance.
      done.store(true, AtomicOrdering::Release);
      if let Some(tx) = result_tx {
        if tx.send(outcome).is_err() {
          trace!("ticket dropped before result delivery");
        }
      }
      let _ = handoff_tx.send(StageReport { stage_id, panicked });

      // Sweep, linearized with appends by the per-key update: remove the
      // entry iff the stored tail is done. A newer tail appended since this
      // stage finished reports not-done and keeps the lane in service.
      registry.update(key, |slot| match slot {
        Some(tail) if tail.done.load(AtomicOrdering::Acquire) => {
          trace!(tail_stage = tail.stage_id, "sweeping drained lane off the registry");
          (LaneUpdate::Remove, ())
        }
        Some(tail) => {
          trace!(tail_stage = tail.stage_id, "keeping lane in service, newer work pending");
          (LaneUpdate::Keep, ())
        }
        None => (LaneUpdate::Keep, ()),
      });

      dispatcher.task_finished();
    };
    self.dispatcher.spawn(stage.instrument(span));

    Ok(stage_id)
  }

  fn active_lane_count(&self) -> usize {
    self.registry.len()
  }
}
