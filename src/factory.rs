use crate::dispatch::Dispatcher;
use crate::error::SequencerError;
use crate::executor::KeyedExecutor;
use crate::lane::chained::ChainedLanes;
use crate::lane::pooled::PooledLanes;
use crate::lane::{LaneCore, LaneStrategy};
use crate::task::{ResultSender, TaskFuture};

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::{FairMutex, Mutex};
use tokio::runtime::Handle as TokioHandle;
use tracing::info;

const DEFAULT_NAME: &str = "keylane";

fn default_pool_size() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Bounded-keys adapter: hashes every key onto one of `buckets` lanes.
///
/// Keys that collide share a lane and serialize with each other. That is the
/// documented trade of bounding the number of simultaneously active lanes,
/// not a bug. Hashing uses a per-factory `RandomState`, so assignment is
/// stable for the factory's lifetime.
struct BucketedLanes<R: Send + 'static> {
  inner: Arc<dyn LaneCore<u64, R>>,
  buckets: u64,
  hash_builder: RandomState,
}

impl<K, R> LaneCore<K, R> for BucketedLanes<R>
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
    let bucket = self.hash_builder.hash_one(&key) % self.buckets;
    self.inner.append(bucket, task, result_tx)
  }

  fn active_lane_count(&self) -> usize {
    self.inner.active_lane_count()
  }
}

enum EntryLock {
  Fair(FairMutex<()>),
  Unfair(Mutex<()>),
}

/// Optional outer adapter that serializes entry into the core under one
/// mutex. The lock covers only the submission bookkeeping, never task
/// execution, so holding it stays cheap.
struct LinearizedLanes<K: 'static, R: Send + 'static> {
  inner: Arc<dyn LaneCore<K, R>>,
  entry: EntryLock,
}

impl<K, R> LaneCore<K, R> for LinearizedLanes<K, R>
where
  K: Clone + Send + Sync + 'static,
  R: Send + 'static,
{
  fn append(
    &self,
    key: K,
    task: TaskFuture<R>,
    result_tx: Option<ResultSender<R>>,
  ) -> Result<u64, SequencerError> {
    match &self.entry {
      EntryLock::Fair(lock) => {
        let _entry = lock.lock();
        self.inner.append(key, task, result_tx)
      }
      EntryLock::Unfair(lock) => {
        let _entry = lock.lock();
        self.inner.append(key, task, result_tx)
      }
    }
  }

  fn active_lane_count(&self) -> usize {
    self.inner.active_lane_count()
  }
}

/// Configures and builds a [`SequencerFactory`].
#[derive(Debug, Clone)]
pub struct SequencerBuilder {
  name: String,
  strategy: LaneStrategy,
  max_concurrency: Option<usize>,
  pool_size: Option<usize>,
  linearize: Option<bool>,
}

impl Default for SequencerBuilder {
  fn default() -> Self {
    Self {
      name: DEFAULT_NAME.to_string(),
      strategy: LaneStrategy::default(),
      max_concurrency: None,
      pool_size: None,
      linearize: None,
    }
  }
}

impl SequencerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name used in logs and spans.
  pub fn name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  /// Lane strategy. Defaults to [`LaneStrategy::ChainedStages`].
  pub fn strategy(mut self, strategy: LaneStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  /// Bounds the number of simultaneously active lanes by hashing keys onto
  /// `max` buckets, and sizes the execution pool to `max`. Must be positive;
  /// the default is unbounded keys.
  pub fn max_concurrency(mut self, max: usize) -> Self {
    self.max_concurrency = Some(max);
    self
  }

  /// Execution pool size when keys are unbounded. Defaults to the host's
  /// available parallelism. Ignored when `max_concurrency` is set.
  pub fn pool_size(mut self, size: usize) -> Self {
    self.pool_size = Some(size);
    self
  }

  /// Serializes entry into submission bookkeeping under a single mutex,
  /// optionally fair. Off by default; task execution is never under the
  /// lock.
  pub fn linearize_submissions(mut self, fair: bool) -> Self {
    self.linearize = Some(fair);
    self
  }

  /// Builds the factory on the given Tokio handle.
  ///
  /// # Errors
  /// `InvalidMaxConcurrency` when `max_concurrency` was set to zero.
  pub fn build<K, R>(self, tokio_handle: TokioHandle) -> Result<SequencerFactory<K, R>, SequencerError>
  where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    R: Send + 'static,
  {
    if self.max_concurrency == Some(0) {
      return Err(SequencerError::InvalidMaxConcurrency(0));
    }

    let pool_size = self
      .max_concurrency
      .or(self.pool_size)
      .unwrap_or_else(default_pool_size);
    let dispatcher = Dispatcher::new(&self.name, pool_size, tokio_handle);

    let core: Arc<dyn LaneCore<K, R>> = match self.max_concurrency {
      Some(buckets) => {
        let inner: Arc<dyn LaneCore<u64, R>> = match self.strategy {
          LaneStrategy::ChainedStages => Arc::new(ChainedLanes::new(dispatcher.clone())),
          LaneStrategy::PooledWorkers => Arc::new(PooledLanes::new(dispatcher.clone())),
        };
        Arc::new(BucketedLanes {
          inner,
          buckets: buckets as u64,
          hash_builder: RandomState::new(),
        })
      }
      None => match self.strategy {
        LaneStrategy::ChainedStages => Arc::new(ChainedLanes::new(dispatcher.clone())),
        LaneStrategy::PooledWorkers => Arc::new(PooledLanes::new(dispatcher.clone())),
      },
    };

    let core: Arc<dyn LaneCore<K, R>> = match self.linearize {
      Some(fair) => Arc::new(LinearizedLanes {
        inner: core,
        entry: if fair {
          EntryLock::Fair(FairMutex::new(()))
        } else {
          EntryLock::Unfair(Mutex::new(()))
        },
      }),
      None => core,
    };

    info!(
      sequencer = %dispatcher.name(),
      strategy = ?self.strategy,
      max_concurrency = ?self.max_concurrency,
      pool_size,
      "sequencer factory constructed"
    );
    Ok(SequencerFactory { core, dispatcher })
  }
}

/// The user-facing entry point: mints per-key executor handles over one
/// shared pool and owns the pool's lifecycle.
///
/// The lane registry is scoped to the factory instance; two factories never
/// share lanes, keys, or workers.
pub struct SequencerFactory<K: 'static, R: Send + 'static> {
  core: Arc<dyn LaneCore<K, R>>,
  dispatcher: Arc<Dispatcher>,
}

impl<K, R> SequencerFactory<K, R>
where
  K: Hash + Eq + Clone + Send + Sync + 'static,
  R: Send + 'static,
{
  /// Returns an executor handle for `key`. Handles are cheap; submissions
  /// through any handle for an equal key serialize on the same lane.
  pub fn handle(&self, key: K) -> KeyedExecutor<K, R> {
    KeyedExecutor::new(key, self.core.clone(), self.dispatcher.clone())
  }

  pub fn name(&self) -> &str {
    self.dispatcher.name()
  }

  /// Number of keys with an in-service lane right now. Drains to zero once
  /// all submitted work completes.
  pub fn active_lane_count(&self) -> usize {
    self.core.active_lane_count()
  }

  pub fn is_shutdown(&self) -> bool {
    self.dispatcher.is_shutdown()
  }

  pub fn is_terminated(&self) -> bool {
    self.dispatcher.is_terminated()
  }

  /// Graceful close: stops admission, waits for every accepted task (queued
  /// successors included) to finish. Afterwards every handed-out handle
  /// reports shut down and terminated.
  pub async fn close(&self) {
    self.dispatcher.close().await;
    info!(sequencer = %self.dispatcher.name(), "sequencer factory closed");
  }
}

impl<K: 'static, R: Send + 'static> Drop for SequencerFactory<K, R> {
  fn drop(&mut self) {
    // Dropping without close() still stops admission; accepted work drains
    // on the runtime without being awaited here.
    self.dispatcher.signal_shutdown();
  }
}
