//! Bounded MPMC channel (L2).
//!
//! # Mental model
//!
//! - A [`Channel`] is a FIFO ring of items shared by any number of senders and
//!   receivers, guarded by one mutex and two condvars (`not_full`, `not_empty`).
//! - `capacity == 0` means unbounded: sends never block on capacity, only on
//!   `close`.
//! - Ownership of a queued item is either transferred to a receiver or
//!   dropped on `close`/`Drop` — never both. Because items are plain owned
//!   `T` values, Rust's `Drop` impl is the item destructor; no separate
//!   destructor callback field is carried.
//!
//! # Invariants
//!
//! 1. After `close`, `send`/`try_send` fail with [`RuntimeError::Closed`];
//!    `recv`/`try_recv` drain any residual items before reporting closed.
//!    - Enforced in: `send_until`, `recv_until`.
//!    - Tested by: `tests::close_drains_then_reports_closed`.
//! 2. Every item successfully enqueued has exactly one outcome: delivered to a
//!    receiver, or dropped by `Channel::drop`/`close`.
//!    - Enforced in: ring buffer ownership — no clone path exists.
//!    - Tested by: `tests::no_item_observed_twice_under_contention`.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::deadline::Deadline;
use crate::error::{Result, RuntimeError};

struct Inner<T> {
	queue: VecDeque<T>,
	capacity: usize,
	closed: bool,
}

/// A bounded (or unbounded, when `capacity == 0`) multi-producer
/// multi-consumer FIFO channel.
pub struct Channel<T> {
	inner: Mutex<Inner<T>>,
	not_full: Condvar,
	not_empty: Condvar,
}

/// Outcome of a non-blocking send.
#[derive(Debug)]
pub enum TrySendError<T> {
	/// The channel is at capacity.
	Full(T),
	/// The channel is closed.
	Closed(T),
}

impl<T> Channel<T> {
	/// Creates a channel. `capacity == 0` means unbounded.
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				queue: VecDeque::new(),
				capacity,
				closed: false,
			}),
			not_full: Condvar::new(),
			not_empty: Condvar::new(),
		}
	}

	/// Blocks until the item is enqueued or the channel closes.
	pub fn send(&self, item: T) -> Result<()> {
		self.send_until(item, Deadline::INFINITE)
	}

	/// Blocks until the item is enqueued, the channel closes, or `deadline`
	/// passes.
	pub fn send_until(&self, item: T, deadline: Deadline) -> Result<()> {
		let mut inner = self.inner.lock();
		loop {
			if inner.closed {
				return Err(RuntimeError::Closed);
			}
			if inner.capacity == 0 || inner.queue.len() < inner.capacity {
				inner.queue.push_back(item);
				drop(inner);
				self.not_empty.notify_one();
				return Ok(());
			}
			match deadline.instant() {
				None => {
					self.not_full.wait(&mut inner);
				}
				Some(at) => {
					let now = Instant::now();
					if now >= at {
						return Err(RuntimeError::Timeout);
					}
					let timed_out = self.not_full.wait_until(&mut inner, at).timed_out();
					if timed_out && inner.capacity != 0 && inner.queue.len() >= inner.capacity && !inner.closed {
						return Err(RuntimeError::Timeout);
					}
				}
			}
		}
	}

	/// Non-blocking send.
	pub fn try_send(&self, item: T) -> std::result::Result<(), TrySendError<T>> {
		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(TrySendError::Closed(item));
		}
		if inner.capacity != 0 && inner.queue.len() >= inner.capacity {
			return Err(TrySendError::Full(item));
		}
		inner.queue.push_back(item);
		drop(inner);
		self.not_empty.notify_one();
		Ok(())
	}

	/// Blocks until an item is available or the channel is closed and empty.
	pub fn recv(&self) -> Result<T> {
		self.recv_until(Deadline::INFINITE)
	}

	/// Blocks until an item is available, the channel closes and drains, or
	/// `deadline` passes.
	pub fn recv_until(&self, deadline: Deadline) -> Result<T> {
		let mut inner = self.inner.lock();
		loop {
			if let Some(item) = inner.queue.pop_front() {
				drop(inner);
				self.not_full.notify_one();
				return Ok(item);
			}
			if inner.closed {
				return Err(RuntimeError::Closed);
			}
			match deadline.instant() {
				None => {
					self.not_empty.wait(&mut inner);
				}
				Some(at) => {
					let now = Instant::now();
					if now >= at {
						return Err(RuntimeError::Timeout);
					}
					let timed_out = self.not_empty.wait_until(&mut inner, at).timed_out();
					if timed_out && inner.queue.is_empty() && !inner.closed {
						return Err(RuntimeError::Timeout);
					}
				}
			}
		}
	}

	/// Non-blocking receive.
	pub fn try_recv(&self) -> Result<T> {
		let mut inner = self.inner.lock();
		if let Some(item) = inner.queue.pop_front() {
			drop(inner);
			self.not_full.notify_one();
			return Ok(item);
		}
		if inner.closed {
			Err(RuntimeError::Closed)
		} else {
			Err(RuntimeError::WouldBlock)
		}
	}

	/// Marks the channel closed. Idempotent: closing twice has the effect of
	/// closing once.
	pub fn close(&self) {
		let mut inner = self.inner.lock();
		if inner.closed {
			return;
		}
		inner.closed = true;
		let residual = inner.queue.len();
		drop(inner);
		trace!(residual, "channel closed");
		self.not_full.notify_all();
		self.not_empty.notify_all();
	}

	/// True once `close` has been called.
	pub fn is_closed(&self) -> bool {
		self.inner.lock().closed
	}

	/// Current queued item count.
	pub fn len(&self) -> usize {
		self.inner.lock().queue.len()
	}

	/// True if no items are currently queued.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Configured capacity (0 means unbounded).
	pub fn capacity(&self) -> usize {
		self.inner.lock().capacity
	}
}
