//! Actors over the promise/future core (L7).
//!
//! # Mental model
//!
//! - An actor owns a bounded [`Channel`] mailbox of [`Envelope`]s and a
//!   single mutable `Behavior` closure, but no dedicated thread: draining the
//!   mailbox is a task resubmitted to a shared [`Pool`] every time the
//!   mailbox transitions from empty to non-empty. A `scheduled` flag ensures
//!   at most one drain task per actor is ever in flight, so messages are
//!   still processed strictly in order with never more than one in flight.
//! - `tell` (fire-and-forget) and `ask` (request/reply via a promise) are
//!   both represented by the same `Envelope` enum, tagged at the call site —
//!   the original design's pointer-shape sniffing is replaced by an
//!   ordinary enum discriminant, which is both safe and how Rust naturally
//!   expresses a tagged union.
//! - A behavior can swap itself out for the next message ("become") by
//!   returning `Some(next)` as the second element of its own result tuple;
//!   returning `None` keeps the current behavior running.
//! - A panicking behavior transitions the actor straight to `Crashed` and
//!   stops scheduling it; it never silently eats the panic and carries on
//!   processing the next message in a possibly-corrupt state.
//! - A full mailbox blocks a `tell`'s sender... no: `tell` still drops and
//!   counts the overflow. `ask` is different — an asker that hits a full
//!   mailbox falls back to a blocking send rather than failing fast, since an
//!   ask that silently fails the instant the mailbox is momentarily full
//!   would be far more surprising to a caller than a brief wait.
//!
//! # Invariants
//!
//! 1. Messages are delivered to the behavior in the order they were
//!    enqueued, one at a time.
//!    - Enforced in: the `scheduled` flag limiting an actor to one drain task
//!      at a time, draining one `Channel` in FIFO order.
//!    - Tested by: `tests::messages_processed_in_fifo_order`.
//! 2. An `ask` whose asker times out still lets a late reply complete
//!    harmlessly; the reply is simply unobserved.
//!    - Enforced in: `Promise::fulfill`'s late-transition tolerance, not
//!      anything actor-specific — the timeout only governs the asker's own
//!      `Future::await_blocking` call, never the promise's validity.
//!    - Tested by: `tests::late_reply_after_ask_timeout_does_not_panic`.
//! 3. A mailbox at capacity drops the newest `tell` rather than blocking the
//!    sender, and the drop is counted. An `ask` against the same full
//!    mailbox instead falls back to a blocking send, since dropping a reply
//!    the caller is waiting on is a worse failure mode than a brief stall.
//!    - Enforced in: `ActorRef::tell`'s `try_send` + `overflow_count`;
//!      `ActorRef::ask`'s `try_send`-then-`send` fallback.
//!    - Tested by: `tests::tell_against_full_mailbox_counts_overflow`,
//!      `tests::ask_against_full_mailbox_blocks_instead_of_dropping`.
//! 4. A panicking behavior invocation transitions the actor to `Crashed` and
//!    stops further dispatch; it is never retried in place.
//!    - Enforced in: `drain_batch`'s `catch_unwind` around each dispatch.
//!    - Tested by: `tests::panicking_behavior_crashes_the_actor`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace, warn};

use crate::channel::{Channel, TrySendError};
use crate::config::RuntimeConfig;
use crate::deadline::Deadline;
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::pool::Pool;
use crate::promise::{Future, Promise};

/// Lifecycle state of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
	/// Spawned, no drain task has run yet.
	Init,
	/// Normal operation.
	Running,
	/// `stop` was requested; draining remaining mail before exit.
	Stopping,
	/// A behavior invocation panicked.
	Crashed,
	/// The mailbox is closed and no more drain tasks will run.
	Closed,
}

/// A message in an actor's mailbox, tagged as fire-and-forget or
/// request/reply.
pub enum Envelope<M, R> {
	Plain(M),
	Ask(M, Promise<R>),
}

/// Per-actor counters, sampled without synchronizing with message dispatch.
#[derive(Debug, Default)]
pub struct ActorStats {
	pub processed: u64,
	pub overflow: u64,
	pub mailbox_peak: usize,
	/// Exponential moving average of per-message processing latency, in
	/// nanoseconds, with smoothing factor `1/8`.
	pub avg_latency_ns: f64,
}

struct StatsInner {
	processed: AtomicU64,
	overflow: AtomicU64,
	mailbox_peak: AtomicUsize,
	avg_latency_ns: Mutex<f64>,
}

impl Default for StatsInner {
	fn default() -> Self {
		StatsInner {
			processed: AtomicU64::new(0),
			overflow: AtomicU64::new(0),
			mailbox_peak: AtomicUsize::new(0),
			avg_latency_ns: Mutex::new(0.0),
		}
	}
}

const LATENCY_EMA_ALPHA: f64 = 1.0 / 8.0;

impl StatsInner {
	fn record(&self, latency: std::time::Duration) {
		self.processed.fetch_add(1, Ordering::Relaxed);
		let sample = latency.as_nanos() as f64;
		let mut avg = self.avg_latency_ns.lock();
		*avg = if *avg == 0.0 { sample } else { *avg + LATENCY_EMA_ALPHA * (sample - *avg) };
	}

	fn note_mailbox_len(&self, len: usize) {
		let mut peak = self.mailbox_peak.load(Ordering::Relaxed);
		while len > peak {
			match self
				.mailbox_peak
				.compare_exchange_weak(peak, len, Ordering::Relaxed, Ordering::Relaxed)
			{
				Ok(_) => break,
				Err(observed) => peak = observed,
			}
		}
	}

	fn snapshot(&self) -> ActorStats {
		ActorStats {
			processed: self.processed.load(Ordering::Relaxed),
			overflow: self.overflow.load(Ordering::Relaxed),
			mailbox_peak: self.mailbox_peak.load(Ordering::Relaxed),
			avg_latency_ns: *self.avg_latency_ns.lock(),
		}
	}
}

/// Maximum messages a single drain task processes before yielding the pool
/// worker back and resubmitting itself, so one busy actor cannot starve the
/// rest of the pool's work.
const DRAIN_BATCH_LIMIT: usize = 32;

struct Shared<M, R> {
	mailbox: Channel<Envelope<M, R>>,
	state: Mutex<ActorState>,
	closed_cv: Condvar,
	stats: StatsInner,
	behavior: Mutex<Behavior<M, R>>,
	pool: Arc<Pool>,
	/// At most one drain task per actor may be queued/running at a time.
	scheduled: AtomicBool,
}

/// A cloneable, `tell`/`ask`-only handle to a running actor.
pub struct ActorRef<M, R> {
	shared: Arc<Shared<M, R>>,
}

impl<M, R> Clone for ActorRef<M, R> {
	fn clone(&self) -> Self {
		ActorRef {
			shared: Arc::clone(&self.shared),
		}
	}
}

/// The behavior closure an actor runs against each message. Returns an
/// optional replacement behavior to "become" for subsequent messages.
pub type Behavior<M, R> = Box<dyn FnMut(&ActorContext<M, R>, M) -> (R, Option<Behavior<M, R>>) + Send>;

/// Context handed to a behavior invocation: a self-reference for sending
/// messages to itself or children, and read access to live stats.
pub struct ActorContext<M, R> {
	pub self_ref: ActorRef<M, R>,
}

impl<M, R> ActorContext<M, R>
where
	M: Send + 'static,
	R: Send + 'static,
{
	/// Requests a graceful stop after the current dispatch returns: the
	/// mailbox is closed (no further `tell`/`ask` are accepted) but whatever
	/// is already queued is drained before the actor settles into
	/// [`ActorState::Closed`]. A supervised child that calls this — as
	/// opposed to panicking — is a *normal* exit for restart-policy purposes:
	/// a `Transient` or `Temporary` child is not restarted for it, only a
	/// `Permanent` one is.
	pub fn request_stop(&self) {
		let mut state = self.self_ref.shared.state.lock();
		if *state == ActorState::Running {
			*state = ActorState::Stopping;
		}
		drop(state);
		self.self_ref.shared.mailbox.close();
	}
}

/// Owns an actor's lifetime. Dropping it without calling `stop` first runs
/// the same graceful-close sequence; `stop` is just the explicit spelling.
pub struct ActorCell<M, R> {
	shared: Arc<Shared<M, R>>,
	finished: bool,
}

/// Spawns an actor whose mailbox-drain work runs on `pool` rather than a
/// dedicated thread, against a mailbox of `capacity` (0 means unbounded).
pub fn spawn<M, R>(pool: Arc<Pool>, capacity: usize, initial_behavior: Behavior<M, R>) -> (ActorCell<M, R>, ActorRef<M, R>)
where
	M: Send + 'static,
	R: Send + 'static,
{
	let shared = Arc::new(Shared {
		mailbox: Channel::new(capacity),
		state: Mutex::new(ActorState::Init),
		closed_cv: Condvar::new(),
		stats: StatsInner::default(),
		behavior: Mutex::new(initial_behavior),
		pool,
		scheduled: AtomicBool::new(false),
	});
	let actor_ref = ActorRef {
		shared: Arc::clone(&shared),
	};

	(
		ActorCell {
			shared,
			finished: false,
		},
		actor_ref,
	)
}

/// Spawns an actor whose mailbox capacity comes from `config.mailbox_capacity`.
pub fn spawn_with_config<M, R>(pool: Arc<Pool>, config: &RuntimeConfig, initial_behavior: Behavior<M, R>) -> (ActorCell<M, R>, ActorRef<M, R>)
where
	M: Send + 'static,
	R: Send + 'static,
{
	spawn(pool, config.mailbox_capacity, initial_behavior)
}

/// Wins the `scheduled` flag (at most one drain task per actor) and submits
/// one to `shared.pool`. A no-op if a drain task is already in flight.
fn try_schedule<M, R>(shared: &Arc<Shared<M, R>>, self_ref: ActorRef<M, R>)
where
	M: Send + 'static,
	R: Send + 'static,
{
	if shared
		.scheduled
		.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
		.is_err()
	{
		return;
	}
	let shared_for_task = Arc::clone(shared);
	if shared.pool.submit(move || drain_batch(shared_for_task, self_ref)).is_err() {
		// The pool is shutting down; nothing will ever drain this actor
		// again. Settle it into Closed rather than hang a future `stop`.
		shared.scheduled.store(false, Ordering::Release);
		warn!("actor pool rejected drain task, settling actor into Closed");
		let mut state = shared.state.lock();
		if !matches!(*state, ActorState::Closed | ActorState::Crashed) {
			*state = ActorState::Closed;
		}
		drop(state);
		shared.closed_cv.notify_all();
	}
}

/// Runs as a pool task: drains up to `DRAIN_BATCH_LIMIT` messages against the
/// actor's behavior, then either yields back to the pool (resubmitting
/// itself, if mail is likely still queued) or clears `scheduled` once the
/// mailbox is empty.
fn drain_batch<M, R>(shared: Arc<Shared<M, R>>, self_ref: ActorRef<M, R>)
where
	M: Send + 'static,
	R: Send + 'static,
{
	{
		let mut state = shared.state.lock();
		if *state == ActorState::Init {
			*state = ActorState::Running;
		}
	}
	let ctx = ActorContext {
		self_ref: self_ref.clone(),
	};

	for _ in 0..DRAIN_BATCH_LIMIT {
		let envelope = match shared.mailbox.try_recv() {
			Ok(envelope) => envelope,
			Err(RuntimeError::WouldBlock) => {
				shared.scheduled.store(false, Ordering::Release);
				// A sender may have enqueued between our `try_recv` miss and
				// clearing `scheduled`; re-check and re-win the flag so that
				// item isn't left stranded unscheduled.
				if !shared.mailbox.is_empty() {
					try_schedule(&shared, self_ref);
				}
				return;
			}
			Err(_closed) => {
				*shared.state.lock() = ActorState::Closed;
				trace!("actor mailbox closed, no further drain tasks will run");
				shared.closed_cv.notify_all();
				return;
			}
		};
		shared.stats.note_mailbox_len(shared.mailbox.len());

		let start = Instant::now();
		let mut behavior = shared.behavior.lock();
		let result = panic::catch_unwind(AssertUnwindSafe(|| match envelope {
			Envelope::Plain(msg) => {
				let (_, next) = (*behavior)(&ctx, msg);
				next
			}
			Envelope::Ask(msg, promise) => {
				let (reply, next) = (*behavior)(&ctx, msg);
				let _ = promise.fulfill(reply);
				next
			}
		}));

		match result {
			Ok(next) => {
				if let Some(next_behavior) = next {
					*behavior = next_behavior;
				}
				drop(behavior);
				shared.stats.record(start.elapsed());
			}
			Err(panic_payload) => {
				drop(behavior);
				error!("actor behavior panicked, transitioning to Crashed");
				*shared.state.lock() = ActorState::Crashed;
				drop(panic_payload);
				// Leave `scheduled` set: a crashed actor is never drained
				// again, the same as its thread simply exiting in the
				// one-thread-per-actor design this replaced.
				shared.closed_cv.notify_all();
				return;
			}
		}
	}

	// Hit the batch limit with mail likely still queued: yield the pool
	// worker back and resubmit to continue where we left off.
	let shared_for_next = Arc::clone(&shared);
	let self_ref_for_next = self_ref.clone();
	if shared.pool.submit(move || drain_batch(shared_for_next, self_ref_for_next)).is_err() {
		shared.scheduled.store(false, Ordering::Release);
		warn!("actor pool rejected continuation task, actor stalled with mail still queued");
	}
}

impl<M, R> ActorRef<M, R>
where
	M: Send + 'static,
	R: Send + 'static,
{
	/// Fire-and-forget send. If the mailbox is at capacity, the message is
	/// dropped and counted in `overflow` rather than blocking the sender.
	pub fn tell(&self, msg: M) {
		match self.shared.mailbox.try_send(Envelope::Plain(msg)) {
			Ok(()) => {
				try_schedule(&self.shared, self.clone());
			}
			Err(TrySendError::Full(_)) => {
				self.shared.stats.overflow.fetch_add(1, Ordering::Relaxed);
				warn!("actor mailbox full, message dropped");
			}
			Err(TrySendError::Closed(_)) => {
				trace!("tell against closed actor mailbox, message dropped");
			}
		}
	}

	/// Sends a request and returns a future for the reply. Unlike `tell`, a
	/// full mailbox does not drop the request: an asker is waiting on a
	/// specific reply, and silently failing the instant the mailbox is
	/// momentarily at capacity would surprise the caller far more than a
	/// brief blocking wait for room. Only a closed mailbox rejects the
	/// future outright.
	pub fn ask(&self, msg: M) -> Future<R> {
		let promise: Promise<R> = Promise::new();
		let future = promise.future();
		match self.shared.mailbox.try_send(Envelope::Ask(msg, promise.clone())) {
			Ok(()) => {
				try_schedule(&self.shared, self.clone());
			}
			Err(TrySendError::Full(Envelope::Ask(msg, promise))) => match self.shared.mailbox.send(Envelope::Ask(msg, promise.clone())) {
				Ok(()) => {
					try_schedule(&self.shared, self.clone());
				}
				Err(_closed) => {
					let _ = promise.reject(ErrorCode(RuntimeError::Closed.sentinel()));
				}
			},
			Err(TrySendError::Closed(Envelope::Ask(_, promise))) => {
				let _ = promise.reject(ErrorCode(RuntimeError::Closed.sentinel()));
			}
			Err(_) => unreachable!("ask always sends Envelope::Ask"),
		}
		future
	}

	/// Convenience: `ask` then block for the reply or `deadline`.
	pub fn ask_blocking(&self, msg: M, deadline: Deadline) -> Result<R> {
		let future = self.ask(msg);
		future.await_blocking(deadline)?;
		future.take_value().ok_or(RuntimeError::Failed)
	}

	/// Current lifecycle state.
	pub fn state(&self) -> ActorState {
		*self.shared.state.lock()
	}

	/// A snapshot of this actor's counters.
	pub fn stats(&self) -> ActorStats {
		self.shared.stats.snapshot()
	}
}

/// Requests a graceful stop and blocks until the actor settles into
/// `Closed` or `Crashed`. Idempotent: safe to call more than once.
fn stop_and_wait<M, R>(shared: &Arc<Shared<M, R>>)
where
	M: Send + 'static,
	R: Send + 'static,
{
	{
		let mut state = shared.state.lock();
		if matches!(*state, ActorState::Running | ActorState::Init) {
			*state = ActorState::Stopping;
		}
	}
	shared.mailbox.close();
	let self_ref = ActorRef {
		shared: Arc::clone(shared),
	};
	try_schedule(shared, self_ref);

	let mut state = shared.state.lock();
	while !matches!(*state, ActorState::Closed | ActorState::Crashed) {
		shared.closed_cv.wait(&mut state);
	}
}

impl<M, R> ActorCell<M, R>
where
	M: Send + 'static,
	R: Send + 'static,
{
	/// Closes the mailbox (queued mail still drains) and blocks until the
	/// actor settles into `Closed` or `Crashed`.
	pub fn stop(mut self) {
		stop_and_wait(&self.shared);
		self.finished = true;
	}

	/// Current lifecycle state.
	pub fn state(&self) -> ActorState {
		*self.shared.state.lock()
	}
}

impl<M, R> Drop for ActorCell<M, R>
where
	M: Send + 'static,
	R: Send + 'static,
{
	fn drop(&mut self) {
		if self.finished {
			return;
		}
		stop_and_wait(&self.shared);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::mpsc;
	use std::time::Duration;

	fn test_pool() -> Arc<Pool> {
		Arc::new(Pool::new(4))
	}

	fn counter_behavior() -> Behavior<i64, i64> {
		let mut total: i64 = 0;
		Box::new(move |_ctx, delta| {
			total += delta;
			(total, None)
		})
	}

	#[test]
	fn messages_processed_in_fifo_order() {
		let (cell, actor) = spawn(test_pool(), 0, counter_behavior());
		for i in 1..=100i64 {
			actor.tell(i);
		}
		let last = actor.ask_blocking(0, Deadline::after(Duration::from_secs(1))).unwrap();
		assert_eq!(last, (1..=100i64).sum::<i64>());
		cell.stop();
	}

	#[test]
	fn ask_blocking_returns_behavior_result() {
		let (cell, actor) = spawn(test_pool(), 8, counter_behavior());
		let r1 = actor.ask_blocking(10, Deadline::after(Duration::from_secs(1))).unwrap();
		let r2 = actor.ask_blocking(5, Deadline::after(Duration::from_secs(1))).unwrap();
		assert_eq!(r1, 10);
		assert_eq!(r2, 15);
		cell.stop();
	}

	#[test]
	fn late_reply_after_ask_timeout_does_not_panic() {
		let behavior: Behavior<(), ()> = Box::new(move |_ctx, _msg| {
			std::thread::sleep(Duration::from_millis(60));
			((), None)
		});
		let (cell, actor) = spawn(test_pool(), 4, behavior);
		let future = actor.ask(());
		let timeout = future.await_blocking(Deadline::after(Duration::from_millis(5)));
		assert_eq!(timeout, Err(RuntimeError::Timeout));
		// Give the slow behavior time to finish and fulfill the (now
		// unobserved) promise; this must not panic or deadlock.
		std::thread::sleep(Duration::from_millis(120));
		cell.stop();
	}

	#[test]
	fn tell_against_full_mailbox_counts_overflow() {
		let (tx, rx) = mpsc::channel::<()>();
		let behavior: Behavior<(), ()> = Box::new(move |_ctx, _msg| {
			rx.recv().ok();
			((), None)
		});
		let (cell, actor) = spawn(test_pool(), 1, behavior);
		actor.tell(()); // picked up immediately, occupies the in-flight slot
		std::thread::sleep(Duration::from_millis(20));
		actor.tell(()); // fills the capacity-1 mailbox
		actor.tell(()); // overflows
		actor.tell(()); // overflows
		assert!(actor.stats().overflow >= 2);
		let _ = tx.send(());
		let _ = tx.send(());
		cell.stop();
	}

	#[test]
	fn ask_against_full_mailbox_blocks_instead_of_dropping() {
		let (tx, rx) = mpsc::channel::<()>();
		let behavior: Behavior<(), u32> = Box::new(move |_ctx, _msg| {
			rx.recv().ok();
			(7, None)
		});
		let (cell, actor) = spawn(test_pool(), 1, behavior);
		// Occupy the in-flight slot and fill the one-deep mailbox so the next
		// `ask` must hit `TrySendError::Full`.
		let blocked = actor.ask(());
		std::thread::sleep(Duration::from_millis(20));
		actor.tell(());

		let actor_for_ask = actor.clone();
		let blocking_ask = std::thread::spawn(move || actor_for_ask.ask_blocking((), Deadline::after(Duration::from_secs(2))));

		// The ask must still be waiting for room, not already rejected.
		std::thread::sleep(Duration::from_millis(20));
		assert!(!blocking_ask.is_finished());

		let _ = tx.send(()); // unblocks the first ask's dispatch
		let _ = tx.send(()); // unblocks the tell's dispatch
		let _ = tx.send(()); // unblocks the blocking ask's dispatch

		assert_eq!(blocked.await_blocking(Deadline::after(Duration::from_secs(1))), Ok(crate::promise::PromiseState::Fulfilled));
		assert_eq!(blocking_ask.join().unwrap().unwrap(), 7);
		cell.stop();
	}

	#[test]
	fn panicking_behavior_crashes_the_actor() {
		let behavior: Behavior<(), ()> = Box::new(|_ctx, _msg| panic!("behavior blew up"));
		let (cell, actor) = spawn(test_pool(), 4, behavior);
		actor.tell(());
		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(actor.state(), ActorState::Crashed);
		cell.stop();
	}

	#[test]
	fn request_stop_from_within_behavior_reaches_closed_not_crashed() {
		let behavior: Behavior<(), ()> = Box::new(|ctx, _msg| {
			ctx.request_stop();
			((), None)
		});
		let (cell, actor) = spawn(test_pool(), 4, behavior);
		actor.tell(());
		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(actor.state(), ActorState::Closed);
		cell.stop();
	}

	#[test]
	fn many_actors_share_a_small_pool_without_starving_each_other() {
		let pool = test_pool();
		let mut cells = Vec::new();
		let mut actors = Vec::new();
		for _ in 0..16 {
			let (cell, actor) = spawn(Arc::clone(&pool), 16, counter_behavior());
			cells.push(cell);
			actors.push(actor);
		}
		for actor in &actors {
			for i in 1..=50i64 {
				actor.tell(i);
			}
		}
		for actor in &actors {
			let total = actor.ask_blocking(0, Deadline::after(Duration::from_secs(2))).unwrap();
			assert_eq!(total, (1..=50i64).sum::<i64>());
		}
		for cell in cells {
			cell.stop();
		}
	}
}
