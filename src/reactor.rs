//! Reactive event loop (L5): one poller, any number of registered I/O
//! sources and timers, owned and driven by exactly one thread.
//!
//! # Mental model
//!
//! - The loop thread blocks in `Poller::wait`. Any other thread that needs to
//!   interrupt it (registering a new source, cancelling a timer, waking a
//!   cooperative awaiter) writes a byte to the wake socket, always
//!   registered under reserved tag `0`.
//! - Registrations don't touch the poller directly from the calling thread —
//!   only the loop thread ever calls `Poller::add/modify/delete`. Other
//!   threads record an intent in a pending-actions queue and wake the loop;
//!   the loop drains that queue at the top of every iteration, before the
//!   next `wait` call, so a registration is visible no later than the wait
//!   call that follows the wake.
//! - Periodic timers rearm from `now + period`, not `next_fire + period`: a
//!   late tick is never followed by a catch-up burst of callbacks, at the
//!   cost of long-term cadence drift relative to the timer's first deadline.
//!
//! # Invariants
//!
//! 1. `register_io`/`register_timer` may be called from any thread; the
//!    registration is applied before the loop's next `Poller::wait` call.
//!    - Enforced in: pending-action queue drained at the top of `run_loop`.
//!    - Tested by: `tests::register_from_other_thread_is_observed`.
//! 2. A periodic timer never fires more than once per `fire_due_timers` pass
//!    for a single elapsed period, even after a dispatch delay spanning
//!    several periods.
//!    - Enforced in: `fire_due_timers`'s `next_fire = now + period` rearm.
//!    - Tested by: `tests::periodic_timer_rearms_without_drift`.
//! 3. A timer callback runs with the registration table unlocked, so it may
//!    itself register or cancel timers without deadlocking.
//!    - Enforced in: `fire_due_timers` take-then-restore-callback dance.
//!    - Tested by: `tests::timer_callback_can_register_another_timer`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slab::Slab;
use tracing::{trace, warn};

use crate::config::RuntimeConfig;
use crate::poller::{Interest, Poller, ReadinessEvent};
use crate::promise::Wake;

const WAKE_TAG: usize = 0;

/// Upper bound `spawn` (as opposed to `spawn_with_config`) uses for a single
/// `Poller::wait` call when no timer is registered at all.
const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(250);

/// Opaque handle to a registered I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(usize);

/// Opaque handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(usize);

/// Callback invoked with the observed readiness for an I/O registration.
pub type IoCallback = Box<dyn FnMut(Interest) + Send>;
/// Callback invoked when a timer fires.
pub type TimerCallback = Box<dyn FnMut() + Send>;

struct IoRegistration {
	fd: RawFd,
	callback: IoCallback,
}

struct TimerRegistration {
	next_fire: Instant,
	period: Option<Duration>,
	callback: Option<TimerCallback>,
}

enum PendingAction {
	AddIo { key: usize, fd: RawFd, interest: Interest },
	RemoveIo { key: usize, fd: RawFd },
}

struct Inner {
	io: Slab<IoRegistration>,
	timers: Slab<TimerRegistration>,
	pending: Vec<PendingAction>,
}

impl Inner {
	/// Slab key `0` is reserved for the wake socket's poller tag — see
	/// [`WAKE_TAG`]. The IO slab's own key space is otherwise handed
	/// straight to `Poller::add` as the event tag, so the first real
	/// registration must never land on key 0; occupying it with a sentinel
	/// that is never removed keeps `Slab::insert` from ever reissuing it.
	fn new() -> Self {
		let mut io = Slab::new();
		let reserved = io.insert(IoRegistration {
			fd: -1,
			callback: Box::new(|_| {}),
		});
		debug_assert_eq!(reserved, 0);
		Inner {
			io,
			timers: Slab::new(),
			pending: Vec::new(),
		}
	}
}

/// A running event loop. Owns the poller and one background thread.
pub struct EventLoop {
	inner: Arc<Mutex<Inner>>,
	wake_write: UnixStream,
	stop: Arc<AtomicBool>,
	handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// A cheap, cloneable handle used to wake a loop from other threads —
/// implements [`Wake`] so a promise core can hold one without depending on
/// the full `EventLoop`.
#[derive(Clone)]
pub struct LoopWaker {
	wake_write: Arc<UnixStream>,
}

impl Wake for LoopWaker {
	fn wake(&self) {
		use std::io::Write;
		let _ = (&*self.wake_write).write(&[1u8]);
	}
}

impl EventLoop {
	/// Spawns the loop thread, using `make_poller` to build the backend
	/// (typically `|| MioPoller::new(1024)`).
	pub fn spawn<P, F>(make_poller: F) -> io::Result<Self>
	where
		P: Poller + 'static,
		F: FnOnce() -> io::Result<P> + Send + 'static,
	{
		Self::spawn_with_poll_slice(DEFAULT_POLL_SLICE, make_poller)
	}

	/// Spawns the loop thread exactly like `spawn`, but bounds an idle
	/// `Poller::wait` call (no timer registered) by `config.poll_slice`
	/// instead of the default.
	pub fn spawn_with_config<P, F>(config: &RuntimeConfig, make_poller: F) -> io::Result<Self>
	where
		P: Poller + 'static,
		F: FnOnce() -> io::Result<P> + Send + 'static,
	{
		Self::spawn_with_poll_slice(config.poll_slice, make_poller)
	}

	fn spawn_with_poll_slice<P, F>(poll_slice: Duration, make_poller: F) -> io::Result<Self>
	where
		P: Poller + 'static,
		F: FnOnce() -> io::Result<P> + Send + 'static,
	{
		let (wake_read, wake_write) = UnixStream::pair()?;
		wake_read.set_nonblocking(true)?;
		wake_write.set_nonblocking(true)?;
		let wake_write = Arc::new(wake_write);

		let inner = Arc::new(Mutex::new(Inner::new()));
		let stop = Arc::new(AtomicBool::new(false));

		let thread_inner = Arc::clone(&inner);
		let thread_stop = Arc::clone(&stop);
		let handle = std::thread::Builder::new()
			.name("runtime-reactor".to_string())
			.spawn(move || {
				let mut poller = match make_poller() {
					Ok(p) => p,
					Err(err) => {
						warn!(%err, "reactor failed to create poller backend");
						return;
					}
				};
				let wake_fd = wake_read.as_raw_fd();
				if let Err(err) = poller.add(wake_fd, WAKE_TAG, Interest::READABLE) {
					warn!(%err, "reactor failed to register wake socket");
					return;
				}
				run_loop(&mut poller, &thread_inner, &thread_stop, &wake_read, poll_slice);
			})?;

		Ok(EventLoop {
			inner,
			wake_write,
			stop,
			handle: Mutex::new(Some(handle)),
		})
	}

	/// A cloneable wake handle for this loop.
	pub fn waker(&self) -> LoopWaker {
		LoopWaker {
			wake_write: Arc::clone(&self.wake_write),
		}
	}

	/// Registers an I/O source. `callback` runs on the loop thread whenever
	/// readiness matching `interest` is observed.
	pub fn register_io(&self, fd: RawFd, interest: Interest, callback: IoCallback) -> IoToken {
		let mut inner = self.inner.lock();
		let key = inner.io.insert(IoRegistration { fd, callback });
		inner.pending.push(PendingAction::AddIo { key, fd, interest });
		drop(inner);
		self.waker().wake();
		IoToken(key)
	}

	/// Deregisters a previously registered I/O source.
	pub fn unregister_io(&self, token: IoToken) {
		let mut inner = self.inner.lock();
		if let Some(reg) = inner.io.try_remove(token.0) {
			inner.pending.push(PendingAction::RemoveIo {
				key: token.0,
				fd: reg.fd,
			});
		}
		drop(inner);
		self.waker().wake();
	}

	/// Registers a one-shot or periodic timer firing `callback` at `delay`
	/// from now, then every `period` thereafter if `period.is_some()`.
	pub fn register_timer(&self, delay: Duration, period: Option<Duration>, callback: TimerCallback) -> TimerToken {
		let mut inner = self.inner.lock();
		let key = inner.timers.insert(TimerRegistration {
			next_fire: Instant::now() + delay,
			period,
			callback: Some(callback),
		});
		drop(inner);
		self.waker().wake();
		TimerToken(key)
	}

	/// Cancels a previously registered timer.
	pub fn unregister_timer(&self, token: TimerToken) {
		self.inner.lock().timers.try_remove(token.0);
	}

	/// Signals the loop thread to stop after its current iteration and joins
	/// it.
	pub fn stop(&self) {
		self.stop.store(true, Ordering::SeqCst);
		self.waker().wake();
		if let Some(handle) = self.handle.lock().take() {
			let _ = handle.join();
		}
	}
}

impl Drop for EventLoop {
	fn drop(&mut self) {
		self.stop();
	}
}

fn run_loop<P: Poller>(poller: &mut P, inner: &Arc<Mutex<Inner>>, stop: &Arc<AtomicBool>, wake_read: &UnixStream, poll_slice: Duration) {
	let mut events: Vec<ReadinessEvent> = Vec::with_capacity(64);
	while !stop.load(Ordering::SeqCst) {
		apply_pending(&inner, poller);

		let timeout = next_timeout(inner, poll_slice);
		events.clear();
		if let Err(err) = poller.wait(timeout, &mut events) {
			warn!(%err, "reactor poll failed");
			continue;
		}
		for event in &events {
			if event.tag == WAKE_TAG {
				drain_wake_socket(wake_read);
				continue;
			}
			dispatch_io(inner, event);
		}
		fire_due_timers(inner);
	}
}

fn apply_pending<P: Poller>(inner: &Arc<Mutex<Inner>>, poller: &mut P) {
	let pending = std::mem::take(&mut inner.lock().pending);
	for action in pending {
		match action {
			PendingAction::AddIo { key, fd, interest } => {
				if let Err(err) = poller.add(fd, key, interest) {
					warn!(%err, fd, "reactor failed to register io source");
				}
			}
			PendingAction::RemoveIo { fd, .. } => {
				if let Err(err) = poller.delete(fd) {
					warn!(%err, fd, "reactor failed to deregister io source");
				}
			}
		}
	}
}

/// The nearest timer deadline, or `poll_slice` as a fallback upper bound when
/// no timer is registered at all — so a `Poller::wait` with nothing to wait
/// on still returns periodically instead of blocking indefinitely.
fn next_timeout(inner: &Arc<Mutex<Inner>>, poll_slice: Duration) -> Option<Duration> {
	let inner = inner.lock();
	let now = Instant::now();
	let nearest_timer = inner.timers.iter().map(|(_, t)| t.next_fire.saturating_duration_since(now)).min();
	Some(nearest_timer.unwrap_or(poll_slice))
}

fn dispatch_io(inner: &Arc<Mutex<Inner>>, event: &ReadinessEvent) {
	let mut inner = inner.lock();
	if let Some(reg) = inner.io.get_mut(event.tag) {
		trace!(tag = event.tag, readable = event.readable, writable = event.writable, "io ready");
		(reg.callback)(Interest {
			readable: event.readable,
			writable: event.writable,
		});
	}
}

/// Invokes every timer whose deadline has passed, rearming periodic ones
/// from `now` (not their own last deadline) so a delayed tick fires its
/// callback once and reschedules, rather than bursting through every period
/// it missed. Callbacks run with the registration table unlocked.
fn fire_due_timers(inner: &Arc<Mutex<Inner>>) {
	loop {
		let now = Instant::now();
		let due = {
			let mut guard = inner.lock();
			let key = guard
				.timers
				.iter()
				.find(|(_, t)| t.next_fire <= now && t.callback.is_some())
				.map(|(k, _)| k);
			let Some(key) = key else {
				return;
			};
			let reg = &mut guard.timers[key];
			let callback = reg.callback.take();
			match reg.period {
				Some(period) => {
					reg.next_fire = now + period;
					(key, callback, true)
				}
				None => {
					guard.timers.remove(key);
					(key, callback, false)
				}
			}
		};
		let (key, callback, periodic) = due;
		if let Some(mut cb) = callback {
			cb();
			if periodic {
				let mut guard = inner.lock();
				if let Some(reg) = guard.timers.get_mut(key) {
					reg.callback = Some(cb);
				}
			}
		}
	}
}

fn drain_wake_socket(stream: &UnixStream) {
	use std::io::Read;
	let mut buf = [0u8; 256];
	let mut s = stream;
	loop {
		match s.read(&mut buf) {
			Ok(0) => break,
			Ok(_) => continue,
			Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
			Err(_) => break,
		}
	}
}
