use futures_each_limit::{source, EachLimit, PoolError};
use std::time::Duration;
use tracing::{info, warn};

/// Pretends to look up a record; id 3 is missing.
async fn lookup(id: u32) -> Result<String, String> {
  tokio::time::sleep(Duration::from_millis(100 * u64::from(id % 4))).await;
  if id == 3 {
    return Err(format!("record {} not found", id));
  }
  Ok(format!("record {}", id))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Short Circuit Example ---");

  // Produced lazily: ids past the failure are never requested.
  let mut next_id = 0;
  let generator = source::from_fn(move || {
    next_id += 1;
    (next_id <= 10).then(|| {
      info!("Producing lookup for id {}", next_id);
      Ok::<_, PoolError>(lookup(next_id))
    })
  });

  let outcome = EachLimit::new(generator)
    .named("lookup_pool")
    .concurrency(2usize)
    .on_fulfilled(|record, key, _aggregate| info!("#{}: {}", key, record))
    .on_rejected(|reason, key, aggregate| {
      warn!("#{} failed: {}. Stopping the pool.", key, reason);
      aggregate.reject(PoolError::Source(reason));
    })
    .wait()
    .await;

  info!("Pool settled with {:?}", outcome);
  info!("--- Short Circuit Example End ---");
}
