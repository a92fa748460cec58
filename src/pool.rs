use crate::aggregate::Aggregate;
use crate::concurrency::Concurrency;
use crate::error::PoolError;
use crate::source::Source;
use crate::task::{self, IntoTask, RunningTask, TaskOutcome};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::stream::{FuturesUnordered, StreamExt};
use futures::task::noop_waker_ref;
use parking_lot::Mutex;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, error, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Success value of the tasks produced by `S`.
pub type TaskValue<S> = <<S as Source>::Item as IntoTask>::Value;
/// Failure reason of the tasks produced by `S`.
pub type TaskReason<S> = <<S as Source>::Item as IntoTask>::Reason;
/// The aggregate handed out by a pool over `S`.
pub type PoolAggregate<S> = Aggregate<(), <S as Source>::Error>;

type OnFulfilled<S> = Box<dyn FnMut(TaskValue<S>, <S as Source>::Key, &PoolAggregate<S>) + Send + 'static>;
type OnRejected<S> = Box<dyn FnMut(TaskReason<S>, <S as Source>::Key, &PoolAggregate<S>) + Send + 'static>;

/// `None` once released.
type StateSlot<S> = Option<PoolState<S>>;

/// Everything the pool owns while it runs. Dropped as a whole the moment the
/// aggregate settles.
struct PoolState<S>
where
  S: Source,
  S::Item: IntoTask,
  S::Error: From<PoolError>,
{
  source: S,
  concurrency: Concurrency,
  on_fulfilled: Option<OnFulfilled<S>>,
  on_rejected: Option<OnRejected<S>>,
  /// Tasks added but not yet stepped past, by submission index. The key is
  /// taken when the task's settlement continuation runs.
  pending: BTreeMap<u64, Option<S::Key>>,
  /// Tasks still running. Only the ones that were woken get polled.
  running: FuturesUnordered<RunningTask<TaskValue<S>, TaskReason<S>>>,
  /// Tasks that completed when first polled, in completion order.
  ready: VecDeque<(u64, TaskOutcome<TaskValue<S>, TaskReason<S>>)>,
  next_index: u64,
  /// Held for the duration of a single `Source::advance`.
  advancing: bool,
}

/// Drives the tasks produced by a [`Source`] with at most N of them in
/// flight, reporting each settlement to the registered callbacks.
///
/// The pool settles a single [`Aggregate`]: fulfilled with `()` once the
/// source is exhausted and every task has settled, or rejected when the
/// source fails. Callbacks receive the aggregate and may settle it
/// themselves to stop the pool early; tasks still in flight are then
/// dropped and their outcomes discarded.
///
/// Nothing runs until the pool is polled, either by awaiting it directly or
/// through [`wait`](EachLimit::wait). The first [`promise`](EachLimit::promise)
/// call (made implicitly by polling) rewinds the source and fills the first
/// batch of tasks.
///
/// Once the aggregate settles, by whichever handle, the pool drops its
/// source, callbacks and tasks straight away, whether or not it is polled
/// again.
pub struct EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask,
  S::Error: From<PoolError>,
{
  pool_id: u64,
  pool_name: Arc<String>,
  aggregate: Option<PoolAggregate<S>>,
  settled_signal: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
  state: Arc<Mutex<StateSlot<S>>>,
}

impl<S> fmt::Debug for EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask,
  S::Error: From<PoolError>,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EachLimit")
      .field("pool_id", &self.pool_id)
      .field("pool_name", &self.pool_name)
      .field("started", &self.aggregate.is_some())
      .field("pending", &self.pending_count())
      .field("settled", &self.is_settled())
      .finish_non_exhaustive()
  }
}

impl<S> EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask,
  S::Error: From<PoolError>,
{
  /// Creates a pool over `source` with unlimited concurrency and no
  /// callbacks.
  pub fn new(source: S) -> Self {
    let pool_id = NEXT_POOL_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    Self {
      pool_id,
      pool_name: Arc::new(format!("each_limit_{}", pool_id)),
      aggregate: None,
      settled_signal: None,
      state: Arc::new(Mutex::new(Some(PoolState {
        source,
        concurrency: Concurrency::Unlimited,
        on_fulfilled: None,
        on_rejected: None,
        pending: BTreeMap::new(),
        running: FuturesUnordered::new(),
        ready: VecDeque::new(),
        next_index: 0,
        advancing: false,
      }))),
    }
  }

  /// Names the pool in log output.
  pub fn named(mut self, pool_name: &str) -> Self {
    self.pool_name = Arc::new(pool_name.to_string());
    self
  }

  pub fn concurrency(self, concurrency: impl Into<Concurrency>) -> Self {
    if let Some(state) = self.state.lock().as_mut() {
      state.concurrency = concurrency.into();
    }
    self
  }

  /// Called with `(value, key, aggregate)` each time a task succeeds.
  pub fn on_fulfilled<F>(self, callback: F) -> Self
  where
    F: FnMut(TaskValue<S>, S::Key, &PoolAggregate<S>) + Send + 'static,
  {
    if let Some(state) = self.state.lock().as_mut() {
      state.on_fulfilled = Some(Box::new(callback));
    }
    self
  }

  /// Called with `(reason, key, aggregate)` each time a task fails. A task
  /// failure does not reject the aggregate unless this callback does so.
  pub fn on_rejected<F>(self, callback: F) -> Self
  where
    F: FnMut(TaskReason<S>, S::Key, &PoolAggregate<S>) + Send + 'static,
  {
    if let Some(state) = self.state.lock().as_mut() {
      state.on_rejected = Some(Box::new(callback));
    }
    self
  }

  pub fn id(&self) -> u64 {
    self.pool_id
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of tasks added but not yet stepped past.
  pub fn pending_count(&self) -> usize {
    Self::pending_in(&self.state.lock())
  }

  pub fn is_settled(&self) -> bool {
    self.aggregate.as_ref().is_some_and(Aggregate::is_settled)
  }

  /// Returns the pool's aggregate, starting the pool on first call.
  ///
  /// Starting rewinds the source and fills the first batch of tasks. If the
  /// source fails while doing so the returned aggregate is already rejected.
  pub fn promise(&mut self) -> PoolAggregate<S> {
    if let Some(aggregate) = &self.aggregate {
      return aggregate.clone();
    }

    let aggregate = Aggregate::new();
    self.settled_signal = Some(Box::pin(aggregate.settled_signal()));
    self.aggregate = Some(aggregate.clone());
    self.release_on_settle(&aggregate);

    let shared = self.state.clone();
    let mut slot = shared.lock();
    info!(
      pool_id = self.pool_id,
      pool_name = %*self.pool_name,
      concurrency = ?slot.as_ref().map(|state| &state.concurrency),
      "Starting pool."
    );

    let rewound = match slot.as_mut() {
      Some(state) => state.source.rewind(),
      None => Ok(()),
    };
    match rewound {
      Ok(()) => self.refill_pending(&mut slot),
      Err(reason) => {
        warn!(pool_id = self.pool_id, pool_name = %*self.pool_name, "Source failed to rewind. Rejecting aggregate.");
        self.reject(&mut slot, reason);
      }
    }
    aggregate
  }

  /// The driver body: a future that polls pending tasks until the aggregate
  /// settles.
  pub fn drive(&mut self) -> impl Future<Output = ()> + '_ {
    future::poll_fn(move |cx| self.poll_drive(cx))
  }

  /// Starts the pool if needed and drives it to settlement.
  pub async fn wait(mut self) -> Result<(), S::Error>
  where
    S::Error: Clone,
  {
    let aggregate = self.promise();
    aggregate.wait_with(self.drive()).await
  }

  /// Drops the pool's state from the settling thread when the aggregate is
  /// settled through a handle held outside the pool.
  fn release_on_settle(&self, aggregate: &PoolAggregate<S>) {
    let slot = Arc::downgrade(&self.state);
    let pool_id = self.pool_id;
    let pool_name = self.pool_name.clone();
    aggregate.on_settle(move |_outcome| {
      let Some(shared) = slot.upgrade() else {
        return;
      };
      // Contended only while the pool is working on its state; it checks for
      // settlement before unlocking.
      let released = shared.try_lock().and_then(|mut state| state.take());
      if let Some(state) = released {
        debug!(
          pool_id,
          pool_name = %*pool_name,
          dropped_tasks = state.pending.len(),
          "Aggregate settled outside the pool. Releasing source, callbacks and pending tasks."
        );
      }
    });
  }

  fn poll_drive(&mut self, cx: &mut Context<'_>) -> Poll<()> {
    self.promise();
    let shared = self.state.clone();
    let mut slot = shared.lock();
    if self.observe_settlement(&mut slot) || self.check_if_finished(&mut slot) {
      return Poll::Ready(());
    }
    self.drain_ready(&mut slot);

    loop {
      if self.observe_settlement(&mut slot) {
        return Poll::Ready(());
      }
      let Some(state) = slot.as_mut() else {
        return Poll::Ready(());
      };
      match state.running.poll_next_unpin(cx) {
        Poll::Ready(Some((index, outcome))) => {
          self.settle_task(&mut slot, index, outcome);
          self.drain_ready(&mut slot);
        }
        Poll::Ready(None) | Poll::Pending => break,
      }
    }

    if Self::pending_in(&slot) == 0 {
      debug!(
        pool_id = self.pool_id,
        pool_name = %*self.pool_name,
        "Nothing in flight and no room for the next task. Waiting for the aggregate to be settled."
      );
    }

    // The aggregate may also be settled through a handle held outside the
    // pool; make sure that wakes the driver too.
    let settled = self
      .settled_signal
      .as_mut()
      .is_some_and(|signal| signal.as_mut().poll(cx).is_ready());
    if settled {
      self.release(&mut slot);
      return Poll::Ready(());
    }
    Poll::Pending
  }

  fn pending_in(slot: &StateSlot<S>) -> usize {
    slot.as_ref().map_or(0, |state| state.pending.len())
  }

  fn refill_pending(&self, slot: &mut StateSlot<S>) {
    let Some(state) = slot.as_mut() else {
      return;
    };
    let pending = state.pending.len();
    match state.concurrency.limit(pending) {
      None => while self.add_pending(slot) && self.advance_iterator(slot) {},
      Some(limit) => {
        let mut room = limit.saturating_sub(pending);
        if room == 0 {
          trace!(pool_id = self.pool_id, pending, limit, "No room to refill.");
          return;
        }
        // Add before the first advance: the next item may only become
        // available once an earlier task has settled.
        if !self.add_pending(slot) {
          return;
        }
        loop {
          room -= 1;
          if room == 0 || !self.advance_iterator(slot) || !self.add_pending(slot) {
            break;
          }
        }
      }
    }
    debug!(pool_id = self.pool_id, pending = Self::pending_in(slot), "Refilled pending tasks.");
  }

  /// Adds the cursor's current item as a task. Never advances the cursor.
  fn add_pending(&self, slot: &mut StateSlot<S>) -> bool {
    let Some(state) = slot.as_mut() else {
      return false;
    };
    let Some((key, item)) = state.source.take_current() else {
      return false;
    };
    let index = state.next_index;
    state.next_index += 1;

    let mut running = task::run_caught(index, item);
    let mut first_poll_cx = Context::from_waker(noop_waker_ref());
    match running.as_mut().poll(&mut first_poll_cx) {
      Poll::Ready((_, outcome)) => state.ready.push_back((index, outcome)),
      Poll::Pending => state.running.push(running),
    }
    state.pending.insert(index, Some(key));
    trace!(
      pool_id = self.pool_id,
      task_index = index,
      pending = state.pending.len(),
      "Added task."
    );
    true
  }

  fn advance_iterator(&self, slot: &mut StateSlot<S>) -> bool {
    let Some(state) = slot.as_mut() else {
      return false;
    };
    if state.advancing {
      trace!(pool_id = self.pool_id, "Source is already advancing; skipping reentrant advance.");
      return false;
    }

    state.advancing = true;
    let advanced = state.source.advance();
    state.advancing = false;

    match advanced {
      Ok(()) => true,
      Err(reason) => {
        warn!(pool_id = self.pool_id, pool_name = %*self.pool_name, "Source failed to advance. Rejecting aggregate.");
        self.reject(slot, reason);
        false
      }
    }
  }

  /// Fulfills the aggregate once the source is exhausted and nothing is
  /// pending.
  fn check_if_finished(&self, slot: &mut StateSlot<S>) -> bool {
    let Some(state) = slot.as_ref() else {
      return true;
    };
    if !state.pending.is_empty() || state.source.has_current() {
      return false;
    }
    info!(pool_id = self.pool_id, pool_name = %*self.pool_name, "Source exhausted and all tasks settled.");
    if let Some(aggregate) = &self.aggregate {
      aggregate.resolve(());
    }
    self.release(slot);
    true
  }

  /// Settlement continuation for the task at `index`.
  fn settle_task(&self, slot: &mut StateSlot<S>, index: u64, outcome: TaskOutcome<TaskValue<S>, TaskReason<S>>) {
    if self.observe_settlement(slot) {
      trace!(pool_id = self.pool_id, task_index = index, "Discarding settlement after aggregate settled.");
      return;
    }
    let (Some(aggregate), Some(state)) = (self.aggregate.as_ref(), slot.as_mut()) else {
      return;
    };
    let Some(key) = state.pending.get_mut(&index).and_then(Option::take) else {
      return;
    };

    match outcome {
      Ok(Ok(value)) => {
        trace!(pool_id = self.pool_id, task_index = index, "Task fulfilled.");
        if let Some(on_fulfilled) = state.on_fulfilled.as_mut() {
          on_fulfilled(value, key, aggregate);
        }
      }
      Ok(Err(reason)) => {
        trace!(pool_id = self.pool_id, task_index = index, "Task rejected.");
        if let Some(on_rejected) = state.on_rejected.as_mut() {
          on_rejected(reason, key, aggregate);
        }
      }
      Err(_panic_payload) => {
        error!(pool_id = self.pool_id, pool_name = %*self.pool_name, task_index = index, "Task panicked.");
        aggregate.reject(PoolError::TaskPanicked { index }.into());
      }
    }
    self.step(slot, index);
  }

  /// Releases the slot held by `index` and tops the pool back up.
  fn step(&self, slot: &mut StateSlot<S>, index: u64) {
    if self.observe_settlement(slot) {
      return;
    }
    let Some(state) = slot.as_mut() else {
      return;
    };
    state.pending.remove(&index);

    // An item still sitting unclaimed under the cursor is the next one to
    // add; advancing now would skip it.
    let advanced = state.source.has_current() || self.advance_iterator(slot);
    if advanced && !self.check_if_finished(slot) {
      self.refill_pending(slot);
    }
  }

  fn drain_ready(&self, slot: &mut StateSlot<S>) {
    while let Some((index, outcome)) = slot.as_mut().and_then(|state| state.ready.pop_front()) {
      self.settle_task(slot, index, outcome);
    }
  }

  fn reject(&self, slot: &mut StateSlot<S>, reason: S::Error) {
    if let Some(aggregate) = &self.aggregate {
      aggregate.reject(reason);
    }
    self.release(slot);
  }

  /// Releases everything the pool holds if the aggregate has settled.
  fn observe_settlement(&self, slot: &mut StateSlot<S>) -> bool {
    if self.is_settled() {
      self.release(slot);
      true
    } else {
      false
    }
  }

  fn release(&self, slot: &mut StateSlot<S>) {
    if let Some(state) = slot.take() {
      debug!(
        pool_id = self.pool_id,
        pool_name = %*self.pool_name,
        dropped_tasks = state.pending.len(),
        "Releasing source, callbacks and pending tasks."
      );
    }
  }
}

impl<S> Future for EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask,
  S::Error: From<PoolError> + Clone,
{
  type Output = Result<(), S::Error>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    ready!(this.poll_drive(cx));
    match this.aggregate.as_ref().and_then(Aggregate::outcome) {
      Some(outcome) => Poll::Ready(outcome),
      None => Poll::Pending,
    }
  }
}

impl<S> Drop for EachLimit<S>
where
  S: Source + Send + 'static,
  S::Key: Send,
  S::Item: IntoTask,
  S::Error: From<PoolError>,
{
  fn drop(&mut self) {
    if let Some(aggregate) = &self.aggregate {
      if !aggregate.is_settled() {
        info!(
          pool_id = self.pool_id,
          pool_name = %*self.pool_name,
          pending = self.pending_count(),
          "Pool dropped before its aggregate settled. Rejecting aggregate."
        );
        aggregate.reject(PoolError::Cancelled.into());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source;
  use crate::task::fulfilled;

  use std::sync::atomic::AtomicUsize;

  #[test]
  fn advance_is_refused_while_another_advance_is_running() {
    let produced = Arc::new(AtomicUsize::new(0));
    let produced_in_source = produced.clone();
    let mut pool = EachLimit::new(source::from_fn(move || {
      produced_in_source.fetch_add(1, AtomicOrdering::SeqCst);
      Some(Ok::<_, PoolError>(fulfilled::<u32, PoolError>(1)))
    }))
    .concurrency(0usize);
    pool.promise();
    assert_eq!(produced.load(AtomicOrdering::SeqCst), 1);

    let shared = pool.state.clone();
    let mut slot = shared.lock();
    slot.as_mut().unwrap().advancing = true;
    assert!(!pool.advance_iterator(&mut slot));
    assert_eq!(produced.load(AtomicOrdering::SeqCst), 1);

    slot.as_mut().unwrap().advancing = false;
    assert!(pool.advance_iterator(&mut slot));
    assert_eq!(produced.load(AtomicOrdering::SeqCst), 2);
    assert!(!slot.as_ref().unwrap().advancing);
  }

  #[test]
  fn failed_advance_releases_the_lock_and_rejects() {
    let mut calls = 0;
    let mut pool = EachLimit::new(source::from_fn(move || {
      calls += 1;
      if calls == 1 {
        Some(Ok(fulfilled::<u32, PoolError>(1)))
      } else {
        Some(Err(PoolError::Source("exhausted producer".into())))
      }
    }))
    .concurrency(0usize);
    let aggregate = pool.promise();

    let shared = pool.state.clone();
    let mut slot = shared.lock();
    assert!(!pool.advance_iterator(&mut slot));
    assert_eq!(aggregate.outcome(), Some(Err(PoolError::Source("exhausted producer".into()))));
    assert!(slot.is_none());
  }

  #[test]
  fn bounded_refill_adds_before_advancing() {
    let produced = Arc::new(AtomicUsize::new(0));
    let produced_in_source = produced.clone();
    let mut pool = EachLimit::new(source::from_fn(move || {
      produced_in_source.fetch_add(1, AtomicOrdering::SeqCst);
      Some(Ok::<_, PoolError>(futures::future::pending::<Result<u32, PoolError>>()))
    }))
    .concurrency(1usize);
    pool.promise();

    assert_eq!(pool.pending_count(), 1);
    assert_eq!(produced.load(AtomicOrdering::SeqCst), 1);
  }

  #[test]
  fn external_settlement_releases_state_without_polling() {
    let mut pool = EachLimit::new(source::iter(vec![
      futures::future::pending::<Result<u32, PoolError>>(),
      futures::future::pending::<Result<u32, PoolError>>(),
    ]));
    let aggregate = pool.promise();
    assert_eq!(pool.pending_count(), 2);
    assert!(pool.state.lock().is_some());

    assert!(aggregate.reject(PoolError::Source("stopped".into())));
    assert!(pool.state.lock().is_none());
    assert_eq!(pool.pending_count(), 0);
  }

  #[test]
  fn only_woken_tasks_are_polled_again() {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    let items = (0..50).map(move |_| {
      let counter = counter.clone();
      future::poll_fn(move |_cx| {
        counter.fetch_add(1, AtomicOrdering::SeqCst);
        Poll::<Result<u32, PoolError>>::Pending
      })
    });
    let mut pool = EachLimit::new(source::iter(items));
    pool.promise();
    // One eager poll each when added.
    assert_eq!(polls.load(AtomicOrdering::SeqCst), 50);

    let mut cx = Context::from_waker(noop_waker_ref());
    assert!(pool.poll_drive(&mut cx).is_pending());
    // Freshly pushed tasks get their first real poll.
    assert_eq!(polls.load(AtomicOrdering::SeqCst), 100);

    // No task was woken, so none is polled again.
    assert!(pool.poll_drive(&mut cx).is_pending());
    assert!(pool.poll_drive(&mut cx).is_pending());
    assert_eq!(polls.load(AtomicOrdering::SeqCst), 100);
  }
}
