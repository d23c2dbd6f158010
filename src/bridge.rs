//! Async bridge and cooperative await (L6).
//!
//! Glues the thread pool and event loop to the promise/future core: `run`
//! hands a plain closure to the pool and returns a future for its result;
//! `run_on_loop` does the same but executes the closure on the reactor
//! thread itself (useful for code that must run serialized with I/O
//! dispatch); `await_on_loop` lets a reactor-thread callback wait on a
//! future without blocking the whole loop, by polling it in short slices
//! and yielding back between them.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::deadline::Deadline;
use crate::error::{ErrorCode, Result, RuntimeError};
use crate::pool::Pool;
use crate::promise::{Future, Promise, PromiseState};
use crate::reactor::EventLoop;

/// The slice width `await_on_loop` (as opposed to `await_on_loop_with_config`)
/// uses for cooperative polling — long enough to avoid spinning, short enough
/// that the loop stays responsive.
const COOPERATIVE_POLL_SLICE: Duration = Duration::from_millis(10);

/// Runs `f` on `pool` and returns a future resolving to its return value.
/// A panic inside `f` rejects the future with [`RuntimeError::Crashed`]
/// rather than poisoning the pool.
pub fn run<T, F>(pool: &Pool, f: F) -> Result<Future<T>>
where
	T: Send + 'static,
	F: FnOnce() -> T + Send + 'static,
{
	let promise: Promise<T> = Promise::new();
	let future = promise.future();
	pool.submit(move || {
		let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
		match result {
			Ok(value) => {
				let _ = promise.fulfill(value);
			}
			Err(_) => {
				debug!("pool-bridged closure panicked, future rejected");
				let _ = promise.reject(ErrorCode(RuntimeError::Crashed(-1).sentinel()));
			}
		}
	})?;
	Ok(future)
}

/// Runs `f` on the event loop's reactor thread via a one-shot timer
/// (effectively "run as soon as possible, serialized with I/O dispatch"),
/// auto-fulfilling the returned future with `f`'s return value. For a
/// callback that completes genuinely asynchronously (e.g. resolving from a
/// second, later timer) use [`run_on_loop_with_promise`] instead.
pub fn run_on_loop<T, F>(event_loop: &EventLoop, f: F) -> Future<T>
where
	T: Send + 'static,
	F: FnOnce() -> T + Send + 'static,
{
	run_on_loop_with_promise(event_loop, move |promise| {
		let _ = promise.fulfill(f());
	})
}

/// Runs `f` on the event loop's reactor thread via a one-shot timer, handing
/// it the `Promise<T>` handle directly instead of auto-fulfilling from a
/// return value. `f` may resolve the promise immediately, or stash it and
/// resolve it later from an independently-registered timer or I/O callback —
/// this is the "genuinely asynchronous completion" mode of spec §4.5's two
/// return modes. If `f` itself panics before resolving, the promise is
/// rejected on its behalf.
pub fn run_on_loop_with_promise<T, F>(event_loop: &EventLoop, f: F) -> Future<T>
where
	T: Send + 'static,
	F: FnOnce(Promise<T>) + Send + 'static,
{
	let promise: Promise<T> = Promise::new();
	let future = promise.future();
	let mut f = Some(f);
	event_loop.register_timer(
		Duration::ZERO,
		None,
		Box::new(move || {
			if let Some(f) = f.take() {
				let promise_for_callback = promise.clone();
				let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(promise_for_callback)));
				if result.is_err() {
					let _ = promise.reject(ErrorCode(RuntimeError::Crashed(-1).sentinel()));
				}
			}
		}),
	);
	future
}

/// Blocks the calling thread (any thread except a reactor thread it would
/// starve) until `future` resolves or `deadline` passes.
pub fn await_future<T>(future: &Future<T>, deadline: Deadline) -> Result<PromiseState> {
	future.await_blocking(deadline)
}

/// Cooperatively waits on `future` from code that must not block the
/// reactor thread it runs on for the whole wait: polls in
/// [`COOPERATIVE_POLL_SLICE`] increments, yielding control back to the
/// caller's own event pump between slices via `on_tick`.
///
/// `on_tick` is invoked once per slice that doesn't resolve the future and
/// should perform a bounded amount of other work (e.g. a partial loop
/// dispatch); it is never invoked after the future resolves or the deadline
/// passes.
pub fn await_on_loop<T>(future: &Future<T>, deadline: Deadline, on_tick: impl FnMut()) -> Result<PromiseState> {
	await_on_loop_sliced(future, deadline, COOPERATIVE_POLL_SLICE, on_tick)
}

/// Identical to [`await_on_loop`], but uses `config.cooperative_poll_interval`
/// as the slice width instead of the crate's hardcoded default.
pub fn await_on_loop_with_config<T>(future: &Future<T>, deadline: Deadline, config: &RuntimeConfig, on_tick: impl FnMut()) -> Result<PromiseState> {
	await_on_loop_sliced(future, deadline, config.cooperative_poll_interval, on_tick)
}

fn await_on_loop_sliced<T>(future: &Future<T>, deadline: Deadline, slice: Duration, mut on_tick: impl FnMut()) -> Result<PromiseState> {
	loop {
		if future.is_done() {
			return Ok(future.state());
		}
		if deadline.has_expired() {
			return Err(RuntimeError::Timeout);
		}
		let slice_deadline = match deadline.remaining() {
			Some(remaining) if remaining < slice => Deadline::after(remaining),
			_ => Deadline::after(slice),
		};
		match future.await_blocking(slice_deadline) {
			Ok(state) => return Ok(state),
			Err(RuntimeError::Timeout) => {
				on_tick();
				continue;
			}
			Err(other) => return Err(other),
		}
	}
}

/// Wakes an [`EventLoop`] when a future bound to it resolves, by handing the
/// loop's [`crate::reactor::LoopWaker`] to the promise at creation time.
/// This is what makes [`await_on_loop`] able to return promptly instead of
/// only at its next slice boundary when the resolution happens to race a
/// slice's sleep.
pub fn promise_with_loop_wake<T>(event_loop: &EventLoop) -> Promise<T> {
	Promise::with_waker(Some(Arc::new(event_loop.waker())))
}
