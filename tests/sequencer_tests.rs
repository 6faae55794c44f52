use keylane::{LaneStrategy, SequencerBuilder, SequencerError, SequencerFactory, TaskFuture};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;

const BOTH_STRATEGIES: [LaneStrategy; 2] = [LaneStrategy::ChainedStages, LaneStrategy::PooledWorkers];

// Helper to initialize tracing for tests; Once ensures it runs once per binary.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,keylane=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn factory_with(strategy: LaneStrategy, name: &str) -> SequencerFactory<String, usize> {
  SequencerBuilder::new()
    .name(name)
    .strategy(strategy)
    .pool_size(8)
    .build(tokio::runtime::Handle::current())
    .unwrap()
}

#[derive(Debug, Clone, Copy)]
struct RunRecord {
  index: usize,
  started: Instant,
  finished: Instant,
}

// A task that records when it actually ran; the push happens on completion,
// so the vector's order is the completion order.
fn recording_task(
  index: usize,
  duration: Duration,
  runs: Arc<Mutex<Vec<RunRecord>>>,
) -> TaskFuture<usize> {
  Box::pin(async move {
    let started = Instant::now();
    sleep(duration).await;
    runs.lock().push(RunRecord {
      index,
      started,
      finished: Instant::now(),
    });
    index
  })
}

fn assert_no_overlap(runs: &[RunRecord]) {
  let mut sorted = runs.to_vec();
  sorted.sort_by_key(|r| r.started);
  for pair in sorted.windows(2) {
    assert!(
      pair[0].finished <= pair[1].started,
      "run intervals overlap: {:?} then {:?}",
      pair[0],
      pair[1]
    );
  }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
  for _ in 0..200 {
    if condition() {
      return;
    }
    sleep(Duration::from_millis(10)).await;
  }
  panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_key_runs_never_overlap() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "single_key_overlap");
    let lane = factory.handle("same-key".to_string());
    let runs = Arc::new(Mutex::new(Vec::new()));

    let mut tickets = Vec::new();
    for i in 0..100 {
      let duration = Duration::from_millis(1 + (i as u64 % 4));
      tickets.push(lane.submit(recording_task(i, duration, runs.clone())).unwrap());
    }
    for ticket in tickets {
      ticket.await_result().await.unwrap();
    }

    {
      let runs = runs.lock();
      assert_eq!(runs.len(), 100, "strategy {:?}", strategy);
      assert_no_overlap(&runs);
    }
    factory.close().await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_key_completes_in_submission_order() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "single_key_fifo");
    let lane = factory.handle("ordered".to_string());
    let runs = Arc::new(Mutex::new(Vec::new()));

    let mut tickets = Vec::new();
    for i in 0..50 {
      tickets.push(
        lane
          .submit(recording_task(i, Duration::from_millis(1), runs.clone()))
          .unwrap(),
      );
    }
    for (i, ticket) in tickets.into_iter().enumerate() {
      assert_eq!(ticket.await_result().await, Ok(i), "strategy {:?}", strategy);
    }

    let completion_order: Vec<usize> = runs.lock().iter().map(|r| r.index).collect();
    let expected: Vec<usize> = (0..50).collect();
    assert_eq!(completion_order, expected, "strategy {:?}", strategy);
    factory.close().await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn distinct_keys_run_in_parallel() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "distinct_keys_parallel");
    let runs = Arc::new(Mutex::new(Vec::new()));

    let started = Instant::now();
    let mut tickets = Vec::new();
    for i in 0..8 {
      let lane = factory.handle(format!("key-{}", i));
      tickets.push(
        lane
          .submit(recording_task(i, Duration::from_millis(100), runs.clone()))
          .unwrap(),
      );
    }
    for ticket in tickets {
      ticket.await_result().await.unwrap();
    }
    let elapsed = started.elapsed();

    // Serial execution would take 800ms; eight independent lanes on a pool
    // of eight must do much better.
    assert!(
      elapsed < Duration::from_millis(400),
      "strategy {:?}: took {:?}",
      strategy,
      elapsed
    );
    factory.close().await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_task_does_not_poison_its_lane() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "lane_survives_panic");
    let lane = factory.handle("fragile".to_string());

    let doomed = lane
      .submit(Box::pin(async {
        panic!("intentional task failure");
        #[allow(unreachable_code)]
        0usize
      }) as TaskFuture<usize>)
      .unwrap();
    let survivor = lane.submit(Box::pin(async { 99usize }) as TaskFuture<usize>).unwrap();

    assert_eq!(
      doomed.await_result().await,
      Err(SequencerError::TaskPanicked),
      "strategy {:?}",
      strategy
    );
    assert_eq!(survivor.await_result().await, Ok(99), "strategy {:?}", strategy);
    factory.close().await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registry_drains_once_all_tasks_complete() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "registry_drains");

    let mut tickets = Vec::new();
    for i in 0..1000 {
      let lane = factory.handle(format!("key-{}", i));
      tickets.push(lane.submit(Box::pin(async move { i as usize }) as TaskFuture<usize>).unwrap());
    }
    for ticket in tickets {
      ticket.await_result().await.unwrap();
    }

    // Sweeps run right after each completion; give them a moment.
    wait_until("registry to drain", || factory.active_lane_count() == 0).await;
    factory.close().await;
    assert_eq!(factory.active_lane_count(), 0, "strategy {:?}", strategy);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execute_is_fire_and_forget() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "fire_and_forget");
    let lane = factory.handle("effects".to_string());
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    lane
      .execute(Box::pin(async move {
        flag.store(true, Ordering::SeqCst);
        0usize
      }) as TaskFuture<usize>)
      .unwrap();

    wait_until("executed task to run", || ran.load(Ordering::SeqCst)).await;
    factory.close().await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_ticket_does_not_cancel_the_task() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "ticket_drop");
    let lane = factory.handle("persistent".to_string());
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    let ticket = lane
      .submit(Box::pin(async move {
        sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::SeqCst);
        0usize
      }) as TaskFuture<usize>)
      .unwrap();
    drop(ticket);

    wait_until("abandoned task to run", || ran.load(Ordering::SeqCst)).await;
    factory.close().await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_after_close_is_rejected() {
  setup_tracing_for_test();
  for strategy in BOTH_STRATEGIES {
    let factory = factory_with(strategy, "submit_after_close");
    let lane = factory.handle("latecomer".to_string());
    factory.close().await;

    let rejected = lane.submit(Box::pin(async { 1usize }) as TaskFuture<usize>);
    assert!(
      matches!(rejected, Err(SequencerError::Shutdown)),
      "strategy {:?}: got {:?}",
      strategy,
      rejected.map(|t| t.id())
    );
  }
}
