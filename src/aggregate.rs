use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::future;
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

/// Observable state of an [`Aggregate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<A, R> {
  Pending,
  Fulfilled(A),
  Rejected(R),
}

impl<A, R> State<A, R> {
  pub fn is_settled(&self) -> bool {
    !matches!(self, State::Pending)
  }

  pub fn is_fulfilled(&self) -> bool {
    matches!(self, State::Fulfilled(_))
  }

  pub fn is_rejected(&self) -> bool {
    matches!(self, State::Rejected(_))
  }
}

type SettleHook<A, R> = Box<dyn FnOnce(&Result<A, R>) + Send + 'static>;

struct Inner<A, R> {
  outcome: Option<Arc<Result<A, R>>>,
  hooks: Vec<SettleHook<A, R>>,
}

struct Shared<A, R> {
  inner: Mutex<Inner<A, R>>,
  settled: CancellationToken,
}

/// A settle-once future shared between a pool, its callbacks and its callers.
///
/// Every clone refers to the same underlying state. The first call to
/// [`settle`](Aggregate::settle) (or `resolve`/`reject`) wins; later calls are
/// ignored and return `false`. Hooks registered with
/// [`on_settle`](Aggregate::on_settle) run exactly once, after settlement,
/// and are dropped afterwards.
pub struct Aggregate<A, R> {
  shared: Arc<Shared<A, R>>,
}

impl<A, R> Clone for Aggregate<A, R> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<A, R> Default for Aggregate<A, R> {
  fn default() -> Self {
    Self::new()
  }
}

impl<A, R> fmt::Debug for Aggregate<A, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.shared.inner.lock();
    let state = match inner.outcome.as_deref() {
      None => "pending",
      Some(Ok(_)) => "fulfilled",
      Some(Err(_)) => "rejected",
    };
    f.debug_struct("Aggregate")
      .field("state", &state)
      .field("hook_count", &inner.hooks.len())
      .finish()
  }
}

impl<A, R> Aggregate<A, R> {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared {
        inner: Mutex::new(Inner {
          outcome: None,
          hooks: Vec::new(),
        }),
        settled: CancellationToken::new(),
      }),
    }
  }

  pub fn is_settled(&self) -> bool {
    self.shared.inner.lock().outcome.is_some()
  }

  /// Returns `true` if both handles refer to the same aggregate.
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.shared, &other.shared)
  }

  pub fn resolve(&self, value: A) -> bool {
    self.settle(Ok(value))
  }

  pub fn reject(&self, reason: R) -> bool {
    self.settle(Err(reason))
  }

  /// Transitions the aggregate out of `Pending`.
  ///
  /// Returns `false` without touching anything if it was already settled.
  pub fn settle(&self, outcome: Result<A, R>) -> bool {
    let (outcome, hooks) = {
      let mut inner = self.shared.inner.lock();
      if inner.outcome.is_some() {
        trace!("Aggregate already settled; ignoring settle call.");
        return false;
      }
      let outcome = Arc::new(outcome);
      inner.outcome = Some(outcome.clone());
      (outcome, std::mem::take(&mut inner.hooks))
    };

    trace!(
      fulfilled = outcome.is_ok(),
      hooks = hooks.len(),
      "Aggregate settled. Running completion hooks."
    );
    self.shared.settled.cancel();
    for hook in hooks {
      hook(&outcome);
    }
    true
  }

  /// Registers a hook that runs once the aggregate settles, whatever the
  /// outcome. Runs immediately if the aggregate is already settled.
  pub fn on_settle<F>(&self, hook: F)
  where
    F: FnOnce(&Result<A, R>) + Send + 'static,
  {
    let settled_outcome = {
      let mut inner = self.shared.inner.lock();
      match &inner.outcome {
        Some(outcome) => outcome.clone(),
        None => {
          inner.hooks.push(Box::new(hook));
          return;
        }
      }
    };
    hook(&settled_outcome);
  }

  pub fn on_fulfilled<F>(&self, callback: F)
  where
    F: FnOnce(&A) + Send + 'static,
  {
    self.on_settle(move |outcome| {
      if let Ok(value) = outcome {
        callback(value);
      }
    });
  }

  pub fn on_rejected<F>(&self, callback: F)
  where
    F: FnOnce(&R) + Send + 'static,
  {
    self.on_settle(move |outcome| {
      if let Err(reason) = outcome {
        callback(reason);
      }
    });
  }

  /// A future that completes once the aggregate settles.
  pub(crate) fn settled_signal(&self) -> WaitForCancellationFutureOwned {
    self.shared.settled.clone().cancelled_owned()
  }
}

impl<A: Clone, R: Clone> Aggregate<A, R> {
  pub fn state(&self) -> State<A, R> {
    match self.shared.inner.lock().outcome.as_deref() {
      None => State::Pending,
      Some(Ok(value)) => State::Fulfilled(value.clone()),
      Some(Err(reason)) => State::Rejected(reason.clone()),
    }
  }

  /// The settled outcome, or `None` while still pending.
  pub fn outcome(&self) -> Option<Result<A, R>> {
    self.shared.inner.lock().outcome.as_deref().cloned()
  }

  /// Waits until some other party settles the aggregate.
  pub async fn wait(&self) -> Result<A, R> {
    loop {
      if let Some(outcome) = self.outcome() {
        return outcome;
      }
      self.shared.settled.cancelled().await;
    }
  }

  /// Runs `body` to drive the aggregate towards settlement, then waits for
  /// the outcome.
  ///
  /// The body is not polled at all if the aggregate is already settled, and
  /// is dropped as soon as the aggregate settles, even if the body itself has
  /// more work left.
  pub async fn wait_with<B>(&self, body: B) -> Result<A, R>
  where
    B: Future<Output = ()>,
  {
    if !self.is_settled() {
      let body = pin!(body);
      let settled = pin!(self.shared.settled.cancelled());
      future::select(body, settled).await;
    }
    self.wait().await
  }
}
