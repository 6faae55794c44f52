//! A Tokio-based per-key sequential task executor: tasks submitted under
//! equal sequence keys run FIFO, one at a time, while tasks under distinct
//! keys run in parallel on one shared pool up to a configured ceiling.
//!
//! ```no_run
//! use keylane::{SequencerBuilder, SequencerFactory, TaskFuture};
//!
//! # async fn demo() -> Result<(), keylane::SequencerError> {
//! let factory: SequencerFactory<String, u32> =
//!   SequencerBuilder::new().name("orders").build(tokio::runtime::Handle::current())?;
//!
//! let lane = factory.handle("customer-42".to_string());
//! let first = lane.submit(Box::pin(async { 1u32 }) as TaskFuture<u32>)?;
//! let second = lane.submit(Box::pin(async { 2u32 }) as TaskFuture<u32>)?;
//! // `second` starts only after `first` completes.
//! assert_eq!(first.await_result().await?, 1);
//! assert_eq!(second.await_result().await?, 2);
//!
//! factory.close().await;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod error;
mod executor;
mod factory;
mod lane;
mod registry;
mod task;
mod ticket;

pub use error::SequencerError;
pub use executor::KeyedExecutor;
pub use factory::{SequencerBuilder, SequencerFactory};
pub use lane::LaneStrategy;
pub use task::TaskFuture;
pub use ticket::TaskTicket;
