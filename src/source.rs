//! Cursors over lazily produced tasks.
//!
//! The pool never iterates a producer directly. It talks to a [`Source`],
//! which behaves like a cursor: it sits on at most one item at a time, hands
//! that item out on request and moves forward only when told to.

use crate::error::PoolError;

use std::iter::{self, Fuse};

/// A cursor over a lazily produced sequence of keyed items.
///
/// Implementations must tolerate [`advance`](Source::advance) being called
/// after the sequence is exhausted; that call is a no-op.
pub trait Source {
  /// Identifies an item to the pool's callbacks. Keys may repeat.
  type Key;
  type Item;
  type Error;

  /// Positions the cursor on the first item.
  ///
  /// Producers that cannot restart treat a rewind after the first item was
  /// produced as a no-op.
  fn rewind(&mut self) -> Result<(), Self::Error>;

  /// `true` while the cursor sits on an item that has not been handed out.
  fn has_current(&self) -> bool;

  fn current_key(&self) -> Option<&Self::Key>;

  /// Hands out the current item, leaving the cursor where it is.
  fn take_current(&mut self) -> Option<(Self::Key, Self::Item)>;

  /// Moves to the next item, producing it. A producer failure surfaces here.
  fn advance(&mut self) -> Result<(), Self::Error>;
}

/// Adapts any iterator of `Result<(key, item), error>` into a [`Source`].
///
/// The first item is produced by `rewind` (or the first `advance`), never
/// at construction. Once the iterator yields an error or runs out, the
/// cursor stays exhausted.
pub struct Cursor<I, K, V> {
  iter: Fuse<I>,
  current: Option<(K, V)>,
  started: bool,
  failed: bool,
}

impl<I, K, V> Cursor<I, K, V>
where
  I: Iterator,
{
  pub fn new(iter: I) -> Self {
    Self {
      iter: iter.fuse(),
      current: None,
      started: false,
      failed: false,
    }
  }
}

impl<I, K, V, E> Cursor<I, K, V>
where
  I: Iterator<Item = Result<(K, V), E>>,
{
  fn produce(&mut self) -> Result<(), E> {
    self.started = true;
    self.current = None;
    if self.failed {
      return Ok(());
    }
    match self.iter.next() {
      Some(Ok(pair)) => {
        self.current = Some(pair);
        Ok(())
      }
      Some(Err(err)) => {
        self.failed = true;
        Err(err)
      }
      None => Ok(()),
    }
  }
}

impl<I, K, V, E> Source for Cursor<I, K, V>
where
  I: Iterator<Item = Result<(K, V), E>>,
{
  type Key = K;
  type Item = V;
  type Error = E;

  fn rewind(&mut self) -> Result<(), E> {
    if self.started {
      return Ok(());
    }
    self.produce()
  }

  fn has_current(&self) -> bool {
    self.current.is_some()
  }

  fn current_key(&self) -> Option<&K> {
    self.current.as_ref().map(|(key, _)| key)
  }

  fn take_current(&mut self) -> Option<(K, V)> {
    self.current.take()
  }

  fn advance(&mut self) -> Result<(), E> {
    self.produce()
  }
}

/// A source over a plain sequence; keys are positions starting at 0.
pub fn iter<I>(items: I) -> Cursor<impl Iterator<Item = Result<(usize, I::Item), PoolError>>, usize, I::Item>
where
  I: IntoIterator,
{
  Cursor::new(items.into_iter().enumerate().map(Ok))
}

/// A source over caller-keyed pairs. Keys are passed through untouched.
pub fn keyed<I, K, V>(pairs: I) -> Cursor<impl Iterator<Item = Result<(K, V), PoolError>>, K, V>
where
  I: IntoIterator<Item = (K, V)>,
{
  Cursor::new(pairs.into_iter().map(Ok))
}

/// A source holding a single item under key 0.
pub fn once<V>(item: V) -> Cursor<impl Iterator<Item = Result<(usize, V), PoolError>>, usize, V> {
  iter(iter::once(item))
}

/// A source over a fallible producer; an `Err` fails the advance that
/// produced it. Keys are positions starting at 0.
pub fn try_iter<I, V, E>(items: I) -> Cursor<impl Iterator<Item = Result<(usize, V), E>>, usize, V>
where
  I: IntoIterator<Item = Result<V, E>>,
{
  Cursor::new(
    items
      .into_iter()
      .enumerate()
      .map(|(position, item)| item.map(|value| (position, value))),
  )
}

/// A generator-like source: `produce` is called once per item and ends the
/// sequence by returning `None`.
pub fn from_fn<F, V, E>(produce: F) -> Cursor<impl Iterator<Item = Result<(usize, V), E>>, usize, V>
where
  F: FnMut() -> Option<Result<V, E>>,
{
  try_iter(iter::from_fn(produce))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cursor_is_lazy_until_rewound() {
    let mut calls = 0;
    let mut source = from_fn(|| {
      calls += 1;
      Some(Ok::<_, PoolError>(calls))
    });
    assert!(!source.has_current());
    source.rewind().unwrap();
    assert_eq!(source.current_key(), Some(&0));
    assert_eq!(source.take_current(), Some((0, 1)));
  }

  #[test]
  fn take_current_leaves_cursor_in_place() {
    let mut source = iter(vec!["a", "b"]);
    source.rewind().unwrap();
    assert_eq!(source.take_current(), Some((0, "a")));
    assert!(!source.has_current());
    assert_eq!(source.take_current(), None);
    source.advance().unwrap();
    assert_eq!(source.take_current(), Some((1, "b")));
  }

  #[test]
  fn advance_past_end_is_a_no_op() {
    let mut source = once(7);
    source.rewind().unwrap();
    source.advance().unwrap();
    assert!(!source.has_current());
    source.advance().unwrap();
    assert!(!source.has_current());
  }

  #[test]
  fn rewind_after_start_does_not_restart() {
    let mut source = iter(1..=3);
    source.rewind().unwrap();
    source.advance().unwrap();
    source.rewind().unwrap();
    assert_eq!(source.current_key(), Some(&1));
  }

  #[test]
  fn producer_error_fails_advance_and_exhausts_cursor() {
    let items = vec![Ok(1), Err(PoolError::Source("broken".into())), Ok(3)];
    let mut source = try_iter(items);
    source.rewind().unwrap();
    assert_eq!(source.advance(), Err(PoolError::Source("broken".into())));
    assert!(!source.has_current());
    source.advance().unwrap();
    assert!(!source.has_current());
  }

  #[test]
  fn keyed_source_keeps_repeated_keys() {
    let mut source = keyed(vec![("dup", 1), ("dup", 2)]);
    source.rewind().unwrap();
    assert_eq!(source.take_current(), Some(("dup", 1)));
    source.advance().unwrap();
    assert_eq!(source.take_current(), Some(("dup", 2)));
  }
}
