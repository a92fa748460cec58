//! Drive a lazily produced sequence of futures with at most N in flight.
//!
//! An [`EachLimit`] pulls tasks from a [`Source`] cursor, keeps no more than
//! its [`Concurrency`] cap running, reports each settlement to its callbacks
//! and settles a single [`Aggregate`] once the source is exhausted. Callbacks
//! receive the aggregate and may settle it early to stop the pool.
//!
//! ```no_run
//! use futures_each_limit::{source, task, EachLimit, PoolError};
//!
//! # async fn run() -> Result<(), PoolError> {
//! let requests = (0..10u32).map(|n| task::fulfilled::<u32, PoolError>(n * 2));
//! EachLimit::new(source::iter(requests))
//!   .concurrency(3usize)
//!   .on_fulfilled(|value, key, _aggregate| println!("#{key} -> {value}"))
//!   .wait()
//!   .await
//! # }
//! ```

mod aggregate;
mod concurrency;
pub mod each;
mod error;
mod pool;
pub mod source;
pub mod task;

pub use aggregate::{Aggregate, State};
pub use concurrency::Concurrency;
pub use error::PoolError;
pub use pool::{EachLimit, PoolAggregate, TaskReason, TaskValue};
pub use source::{Cursor, Source};
pub use task::{IntoTask, TaskToExecute};
