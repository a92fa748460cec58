use std::fmt;

/// How many tasks a pool may keep in flight.
///
/// The policy is consulted on every refill. A `Dynamic` policy receives the
/// number of tasks currently pending and returns the cap to apply right now.
/// A cap of `0` stops new tasks from being added; tasks already in flight
/// still drain.
#[derive(Default)]
pub enum Concurrency {
  #[default]
  Unlimited,
  Fixed(usize),
  Dynamic(Box<dyn FnMut(usize) -> usize + Send + 'static>),
}

impl Concurrency {
  pub fn dynamic<F>(policy: F) -> Self
  where
    F: FnMut(usize) -> usize + Send + 'static,
  {
    Concurrency::Dynamic(Box::new(policy))
  }

  /// Evaluates the cap for the given pending count. `None` means unlimited.
  pub(crate) fn limit(&mut self, pending: usize) -> Option<usize> {
    match self {
      Concurrency::Unlimited => None,
      Concurrency::Fixed(cap) => Some(*cap),
      Concurrency::Dynamic(policy) => Some(policy(pending)),
    }
  }
}

impl From<usize> for Concurrency {
  fn from(cap: usize) -> Self {
    Concurrency::Fixed(cap)
  }
}

impl From<Option<usize>> for Concurrency {
  fn from(cap: Option<usize>) -> Self {
    cap.map_or(Concurrency::Unlimited, Concurrency::Fixed)
  }
}

impl fmt::Debug for Concurrency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Concurrency::Unlimited => f.write_str("Unlimited"),
      Concurrency::Fixed(cap) => f.debug_tuple("Fixed").field(cap).finish(),
      Concurrency::Dynamic(_) => f.write_str("Dynamic(..)"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dynamic_policy_sees_pending_count() {
    let mut policy = Concurrency::dynamic(|pending| if pending == 0 { 2 } else { 1 });
    assert_eq!(policy.limit(0), Some(2));
    assert_eq!(policy.limit(3), Some(1));
  }

  #[test]
  fn conversions() {
    assert_eq!(Concurrency::from(4usize).limit(0), Some(4));
    assert_eq!(Concurrency::from(None).limit(10), None);
    assert_eq!(Concurrency::default().limit(0), None);
  }
}
