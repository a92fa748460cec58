use futures_each_limit::{source, EachLimit, PoolError, TaskToExecute};
use std::time::{Duration, Instant};
use tracing::info;

fn long_task(id: usize) -> TaskToExecute<String, PoolError> {
  Box::pin(async move {
    info!("Task {} starting (should take 1s)", id);
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(format!("Task {} finished", id))
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  let concurrency_limit: usize = 2;
  let num_tasks = 5;
  info!("--- Concurrency Limit Example (Limit: {}) ---", concurrency_limit);
  info!(
    "Running {} tasks, each takes 1 sec. With concurrency {}, this should take ~{} secs.",
    num_tasks,
    concurrency_limit,
    (num_tasks as f32 / concurrency_limit as f32).ceil()
  );

  let started = Instant::now();
  let outcome = EachLimit::new(source::iter((0..num_tasks).map(long_task)))
    .named("concurrency_pool")
    .concurrency(concurrency_limit)
    .on_fulfilled(|result, key, _aggregate| info!("Task {} main: Received result: {}", key, result))
    .wait()
    .await;

  info!("Pool settled with {:?} after {:?}", outcome, started.elapsed());
  info!("--- Concurrency Limit Example End ---");
}
