//! Supervision tree (L8): restart policy and fault isolation above a set of
//! child workloads, each running on its own dedicated OS thread (the third of
//! the runtime's three scheduling domains, alongside the pool and the event
//! loop — a supervised child is never itself pool- or loop-scheduled).
//!
//! # Mental model
//!
//! - A [`Supervisor`] owns a fixed ordered set of [`ChildSpec`]s. A child is
//!   opaque: just a factory that produces a [`ChildFn`] — `FnOnce(StopToken)
//!   -> i32` — run to completion on its own thread each time it (re)starts.
//!   Children are ordinarily heterogeneous; nothing requires them to share a
//!   message type, or to be actors at all.
//! - A dedicated monitor thread blocks on an exit channel fed by every child
//!   thread's trampoline, and reacts to each exit record according to the
//!   supervisor's [`Strategy`]. A termination is *abnormal* if the child
//!   panicked or returned a non-zero status (§4.8: "status indicates failure
//!   (`!= 0`)") — `ChildState::Crashed` only tags the panic case, so
//!   abnormality is always read off the raw [`ExitStatus`], never off
//!   `ChildState`, before it's folded down.
//! - A child that should stop — because it is being restarted as part of a
//!   group, or because the whole supervisor is stopping — is asked
//!   cooperatively via its [`StopToken`]; nothing can force a thread to stop
//!   early, so the wait for it to actually exit is bounded by its own
//!   `shutdown_timeout` rather than left unbounded.
//! - Restart intensity is bounded by a sliding window *per child*: if a given
//!   child crashes more than `max_restarts` times within `window`, the
//!   supervisor gives up and escalates by transitioning itself to `Crashed`
//!   rather than restart-looping forever.
//! - `OneForOne` restarts only the failed child. `OneForAll` restarts every
//!   child, in the order they were given to `start`. `RestForOne` restarts
//!   the failed child and every child specified after it, preserving
//!   relative order — children specified before it are left alone.
//! - [`ChildPolicy`] filters *whether* a terminated child is restarted:
//!   `Permanent` always is; `Transient` only if its own termination was a
//!   crash (a normal exit is left alone) but is still swept into a sibling's
//!   group restart; `Temporary` never is, and is retired for good the moment
//!   it terminates by any means.
//!
//! # Invariants
//!
//! 1. A child that crashes more than `max_restarts` times inside `window`
//!    causes the supervisor to escalate instead of restarting again.
//!    `max_restarts == 0` means unlimited — never escalate on this account.
//!    - Enforced in: `RestartWindow::record_and_check`.
//!    - Tested by: `tests::escalates_after_exceeding_restart_intensity`,
//!      `tests::zero_max_restarts_means_unlimited`.
//! 2. A child that returns a non-zero status is treated as abnormal exactly
//!    like a panic — for `Transient` eligibility and for triggering a
//!    multi-child strategy's group restart — not as a normal exit.
//!    - Enforced in: `handle_exit`'s `crashed` computed from `ExitStatus`.
//!    - Tested by:
//!      `tests::transient_child_returning_a_nonzero_status_is_treated_as_abnormal_and_restarted`.
//! 3. `RestForOne` restarts the crashed child and its successors in their
//!    original relative order, and never touches predecessors.
//!    - Enforced in: `Supervisor::handle_exit`'s `RestForOne` arm.
//!    - Tested by: `tests::rest_for_one_restarts_crashed_and_later_children_only`.
//! 4. Waiting for a child to honor a stop request is bounded by that child's
//!    own `shutdown_timeout` — a child that never observes its `StopToken`
//!    cannot hang `Supervisor::stop` or a group restart forever.
//!    - Enforced in: `await_children_stop`.
//!    - Tested by: `tests::stop_gives_up_on_a_child_that_ignores_its_stop_token`.
//! 5. An exit record whose generation does not match the child slot's current
//!    generation is stale (it belongs to an instance already superseded by a
//!    restart) and is discarded rather than misapplied to the new instance.
//!    - Enforced in: `apply_exit_record`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::deadline::Deadline;
use crate::error::RuntimeError;

/// A child workload: runs to completion on its own thread, cooperatively
/// observing `StopToken` if it wants to be stoppable, and returns an exit
/// code. Matches `Supervisor`'s ordinary case of heterogeneous children —
/// there is no shared message or return type across children.
pub type ChildFn = Box<dyn FnOnce(StopToken) -> i32 + Send>;

struct StopSignal {
	stopped: Mutex<bool>,
	cv: Condvar,
}

/// A cooperative stop request a child may poll or block on. Cloning shares
/// the same underlying signal — every clone observes the same stop.
#[derive(Clone)]
pub struct StopToken {
	inner: Arc<StopSignal>,
}

impl StopToken {
	fn new() -> Self {
		StopToken {
			inner: Arc::new(StopSignal {
				stopped: Mutex::new(false),
				cv: Condvar::new(),
			}),
		}
	}

	fn signal(&self) {
		let mut stopped = self.inner.stopped.lock();
		*stopped = true;
		self.inner.cv.notify_all();
	}

	/// True once the supervisor has asked this child to stop.
	pub fn is_stopped(&self) -> bool {
		*self.inner.stopped.lock()
	}

	/// Blocks until stopped or `deadline` passes, whichever comes first.
	/// Returns `true` if stopped. A child's main loop typically replaces a
	/// plain `thread::sleep` with `token.wait(Deadline::after(tick))` so it
	/// both paces itself and notices a stop request promptly.
	pub fn wait(&self, deadline: Deadline) -> bool {
		let mut stopped = self.inner.stopped.lock();
		loop {
			if *stopped {
				return true;
			}
			match deadline.instant() {
				None => self.inner.cv.wait(&mut stopped),
				Some(at) => {
					if Instant::now() >= at {
						return *stopped;
					}
					self.inner.cv.wait_until(&mut stopped, at);
				}
			}
			if deadline.has_expired() {
				return *stopped;
			}
		}
	}
}

/// How a supervisor reacts to one child terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
	/// Restart only the failed child.
	OneForOne,
	/// Restart every child.
	OneForAll,
	/// Restart the failed child and every child specified after it.
	RestForOne,
}

/// Whether a child is restarted after it terminates, and under what
/// circumstances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildPolicy {
	/// Always restarted, whether it crashed or returned normally.
	Permanent,
	/// Restarted only if its own termination was a crash; a normal return of
	/// this specific child is left alone. Still swept into a restart when a
	/// *different* child triggers a multi-child strategy (`OneForAll` /
	/// `RestForOne`) — the "its own exit" carve-out applies only to this
	/// child's own termination, not to a group restart it is caught up in.
	Transient,
	/// Never restarted; retired for good the moment it terminates, by crash
	/// or by normal return.
	Temporary,
}

/// A child definition: a name (for logging/lookup), a factory producing a
/// fresh [`ChildFn`] on each (re)start, a restart policy, and the bound on
/// how long the supervisor waits for this child to honor a stop request
/// before giving up on it.
pub struct ChildSpec {
	pub name: String,
	pub policy: ChildPolicy,
	pub shutdown_timeout: Duration,
	factory: Box<dyn Fn() -> ChildFn + Send + Sync>,
}

impl ChildSpec {
	/// Builds a spec from a raw factory, with [`ChildPolicy::Permanent`]; use
	/// [`Self::with_policy`] for a different one.
	pub fn new(name: impl Into<String>, shutdown_timeout: Duration, factory: impl Fn() -> ChildFn + Send + Sync + 'static) -> Self {
		ChildSpec {
			name: name.into(),
			policy: ChildPolicy::Permanent,
			shutdown_timeout,
			factory: Box::new(factory),
		}
	}

	/// Builds a spec from the literal `function(arg) -> int` shape: `arg` is
	/// cloned fresh for every (re)start and handed to `function` alongside
	/// that instance's `StopToken`.
	pub fn from_fn<A, F>(name: impl Into<String>, shutdown_timeout: Duration, arg: A, function: F) -> Self
	where
		A: Clone + Send + 'static,
		F: Fn(A, StopToken) -> i32 + Send + Sync + 'static,
	{
		let function = Arc::new(function);
		ChildSpec::new(name, shutdown_timeout, move || {
			let arg = arg.clone();
			let function = Arc::clone(&function);
			Box::new(move |stop: StopToken| function(arg, stop)) as ChildFn
		})
	}

	/// Overrides the restart policy.
	pub fn with_policy(mut self, policy: ChildPolicy) -> Self {
		self.policy = policy;
		self
	}
}

/// Snapshot of one child slot's current run state, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
	Running,
	Exited(i32),
	Crashed,
	/// Terminated and, per policy, deliberately left stopped.
	Retired,
}

struct RunningChild {
	spec: ChildSpec,
	stop: StopToken,
	generation: u64,
	handle: Option<std::thread::JoinHandle<()>>,
	state: ChildState,
}

/// One child thread's terminal outcome, tagged with the slot index and the
/// generation it belongs to so a restart can tell a stale record (from an
/// instance it already superseded) from a fresh one.
struct ExitRecord {
	index: usize,
	generation: u64,
	status: ExitStatus,
}

enum ExitStatus {
	Exited(i32),
	Panicked,
}

/// Tracks termination timestamps in a sliding window to bound one child's
/// restart intensity. Kept per child rather than shared across the whole
/// supervisor, so one flaky child escalating doesn't spend a well-behaved
/// sibling's restart budget.
struct RestartWindow {
	max_restarts: usize,
	window: Duration,
	timestamps: VecDeque<Instant>,
}

impl RestartWindow {
	fn new(max_restarts: usize, window: Duration) -> Self {
		RestartWindow {
			max_restarts,
			window,
			timestamps: VecDeque::new(),
		}
	}

	/// Records a termination now and returns `true` if the restart budget is
	/// still within bounds, `false` if this termination should escalate
	/// instead. `max_restarts == 0` means unlimited (§4.8: "`max_restarts ≤
	/// 0` means unlimited"), so the timestamp deque isn't even grown for it —
	/// there's no budget to ever run out.
	fn record_and_check(&mut self) -> bool {
		if self.max_restarts == 0 {
			return true;
		}
		let now = Instant::now();
		while let Some(&front) = self.timestamps.front() {
			if now.duration_since(front) > self.window {
				self.timestamps.pop_front();
			} else {
				break;
			}
		}
		self.timestamps.push_back(now);
		self.timestamps.len() <= self.max_restarts
	}
}

/// Overall supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
	Running,
	/// Restart intensity exceeded on some child; children were stopped and
	/// the supervisor gave up.
	Crashed,
	Stopped,
}

struct Inner {
	children: Vec<RunningChild>,
	windows: Vec<RestartWindow>,
	strategy: Strategy,
	state: SupervisorState,
	/// Exit records that arrived for a child outside whatever bounded wait
	/// was in progress when they showed up (e.g. an unrelated child crashed
	/// while the monitor was waiting out a group-restart stop). Drained
	/// ahead of the exit channel on `monitor_loop`'s next pass instead of
	/// being dropped.
	deferred: Vec<ExitRecord>,
}

/// Supervises a fixed ordered set of heterogeneous child workloads.
pub struct Supervisor {
	inner: Arc<Mutex<Inner>>,
	exit_tx: Arc<Channel<ExitRecord>>,
	monitor: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Supervisor {
	/// Starts every child and spawns the monitor thread.
	pub fn start(specs: Vec<ChildSpec>, strategy: Strategy, max_restarts: usize, window: Duration) -> Self {
		let exit_tx: Arc<Channel<ExitRecord>> = Arc::new(Channel::new(0));
		let mut children = Vec::with_capacity(specs.len());
		let mut windows = Vec::with_capacity(specs.len());
		for (index, spec) in specs.into_iter().enumerate() {
			windows.push(RestartWindow::new(max_restarts, window));
			let stop = StopToken::new();
			let handle = spawn_child(index, 0, (spec.factory)(), stop.clone(), Arc::clone(&exit_tx), &spec.name);
			children.push(RunningChild {
				spec,
				stop,
				generation: 0,
				handle: Some(handle),
				state: ChildState::Running,
			});
		}

		let inner = Arc::new(Mutex::new(Inner {
			children,
			windows,
			strategy,
			state: SupervisorState::Running,
			deferred: Vec::new(),
		}));

		let monitor_inner = Arc::clone(&inner);
		let monitor_exit_rx = Arc::clone(&exit_tx);
		let monitor = std::thread::Builder::new()
			.name("runtime-supervisor".to_string())
			.spawn(move || monitor_loop(monitor_inner, monitor_exit_rx))
			.expect("failed to spawn supervisor monitor thread");

		Supervisor {
			inner,
			exit_tx,
			monitor: Mutex::new(Some(monitor)),
		}
	}

	/// Starts every child using `config`'s restart-intensity defaults.
	pub fn start_with_config(specs: Vec<ChildSpec>, strategy: Strategy, config: &crate::config::RuntimeConfig) -> Self {
		Supervisor::start(specs, strategy, config.max_restarts, config.restart_window)
	}

	/// The current run state of the child named `name`, if present.
	pub fn child_state(&self, name: &str) -> Option<ChildState> {
		self.inner.lock().children.iter().find(|c| c.spec.name == name).map(|c| c.state)
	}

	/// Current supervisor state.
	pub fn state(&self) -> SupervisorState {
		self.inner.lock().state
	}

	/// Signals every still-running child to stop, waits out each one's own
	/// `shutdown_timeout`, then marks the supervisor stopped. A child that
	/// never observes its `StopToken` is given up on (logged, not joined)
	/// rather than hanging this call.
	pub fn stop(&self) {
		let pending = {
			let mut inner = self.inner.lock();
			if inner.state == SupervisorState::Stopped {
				return;
			}
			signal_running(&mut inner.children)
		};
		await_children_stop(&self.inner, &self.exit_tx, pending);

		if let Some(handle) = self.monitor.lock().take() {
			self.exit_tx.close();
			let _ = handle.join();
		}
		self.inner.lock().state = SupervisorState::Stopped;
	}
}

impl Drop for Supervisor {
	fn drop(&mut self) {
		self.stop();
	}
}

/// Signals every `Running` child's `StopToken` and returns the wait list
/// (`index`, `generation`, `deadline`) the caller should hand to
/// `await_children_stop`.
fn signal_running(children: &mut [RunningChild]) -> Vec<(usize, u64, Deadline)> {
	let mut pending = Vec::new();
	for (index, child) in children.iter_mut().enumerate() {
		if child.state == ChildState::Running {
			child.stop.signal();
			pending.push((index, child.generation, Deadline::after(child.spec.shutdown_timeout)));
		}
	}
	pending
}

/// Blocks until every `(index, generation)` pair in `pending` has produced a
/// matching exit record, or its own deadline passes — whichever is sooner,
/// per entry. Exit records for children not in `pending` are pushed to
/// `inner.deferred` for `monitor_loop` to pick up afterward, rather than
/// applied here (this helper only resolves the wait, it never restarts
/// anything).
fn await_children_stop(inner: &Mutex<Inner>, exit_rx: &Channel<ExitRecord>, mut pending: Vec<(usize, u64, Deadline)>) {
	while !pending.is_empty() {
		let nearest = pending.iter().map(|(_, _, d)| *d).reduce(Deadline::earliest).unwrap();
		match exit_rx.recv_until(nearest) {
			Ok(record) => {
				if let Some(pos) = pending.iter().position(|(i, g, _)| *i == record.index && *g == record.generation) {
					pending.remove(pos);
					apply_exit_record(inner, record);
				} else {
					inner.lock().deferred.push(record);
				}
			}
			Err(RuntimeError::Timeout) => {
				let expired: Vec<usize> = pending.iter().filter(|(_, _, d)| d.has_expired()).map(|(i, _, _)| *i).collect();
				for index in &expired {
					let name = inner.lock().children[*index].spec.name.clone();
					warn!(child = %name, "gave up waiting for stop, child never honored its StopToken within shutdown_timeout");
				}
				pending.retain(|(i, _, _)| !expired.contains(i));
			}
			Err(_closed) => break,
		}
	}
}

/// Applies one exit record to its child slot if it isn't stale, recording
/// the terminal state (`Exited`/`Crashed`) the monitor loop will later
/// evaluate against restart policy.
fn apply_exit_record(inner: &Mutex<Inner>, record: ExitRecord) {
	let mut inner = inner.lock();
	let Some(child) = inner.children.get_mut(record.index) else {
		return;
	};
	if child.generation != record.generation {
		return; // stale: already superseded by a later restart
	}
	child.handle = None;
	child.state = match record.status {
		ExitStatus::Exited(code) => ChildState::Exited(code),
		ExitStatus::Panicked => ChildState::Crashed,
	};
}

fn spawn_child(index: usize, generation: u64, child_fn: ChildFn, stop: StopToken, exit_tx: Arc<Channel<ExitRecord>>, name: &str) -> std::thread::JoinHandle<()> {
	std::thread::Builder::new()
		.name(format!("runtime-supervisor-child-{name}"))
		.spawn(move || {
			let result = catch_unwind(AssertUnwindSafe(|| child_fn(stop)));
			let status = match result {
				Ok(code) => ExitStatus::Exited(code),
				Err(_) => ExitStatus::Panicked,
			};
			let _ = exit_tx.send(ExitRecord { index, generation, status });
		})
		.expect("failed to spawn supervised child thread")
}

fn monitor_loop(inner: Arc<Mutex<Inner>>, exit_rx: Arc<Channel<ExitRecord>>) {
	loop {
		if inner.lock().state != SupervisorState::Running {
			// Escalated (or being stopped): nothing left to monitor. `stop`
			// closes `exit_rx` and joins this thread regardless.
			break;
		}
		let deferred = inner.lock().deferred.pop();
		let record = match deferred {
			Some(record) => record,
			None => match exit_rx.recv() {
				Ok(record) => record,
				Err(_closed) => break,
			},
		};
		handle_exit(&inner, &exit_rx, record);
	}
}

fn handle_exit(inner: &Arc<Mutex<Inner>>, exit_rx: &Arc<Channel<ExitRecord>>, record: ExitRecord) {
	let index = record.index;
	{
		let mut guard = inner.lock();
		if guard.children.get(index).map(|c| c.generation) != Some(record.generation) {
			return; // stale, already superseded
		}
		drop(guard);
	}
	// A panic is always abnormal; a returned status is abnormal iff it's
	// non-zero (§4.8: "If status indicates failure (!= 0)"). Must be read
	// off the exit status itself, before `apply_exit_record` folds it down
	// into `ChildState` — `Exited(code)` carries a non-zero `code` for a
	// failing-but-not-panicking child, which is not `ChildState::Crashed`.
	let crashed = match record.status {
		ExitStatus::Panicked => true,
		ExitStatus::Exited(code) => code != 0,
	};
	apply_exit_record(inner, record);

	let mut guard = inner.lock();
	let name = guard.children[index].spec.name.clone();

	if !crashed && guard.children[index].spec.policy != ChildPolicy::Permanent {
		info!(child = %name, "child exited normally, policy says do not restart");
		guard.children[index].state = ChildState::Retired;
		return;
	}
	if guard.children[index].spec.policy == ChildPolicy::Temporary {
		guard.children[index].state = ChildState::Retired;
		return;
	}

	if !guard.windows[index].record_and_check() {
		error!(child = %name, "restart intensity exceeded, supervisor escalating");
		guard.state = SupervisorState::Crashed;
		let pending = signal_running(&mut guard.children);
		drop(guard);
		await_children_stop(inner, exit_rx, pending);
		return;
	}

	let strategy = guard.strategy;
	let reason = if crashed { "crashed" } else { "exited normally (Permanent)" };
	warn!(child = %name, ?strategy, reason, "restarting per strategy");

	let restart_indices: Vec<usize> = match strategy {
		Strategy::OneForOne => vec![index],
		Strategy::OneForAll => (0..guard.children.len()).collect(),
		Strategy::RestForOne => (index..guard.children.len()).collect(),
	};

	// Any sibling caught up in a group restart that is still Running must be
	// asked to stop and waited out (bounded by its own shutdown_timeout)
	// before it's torn down and rebuilt.
	let mut pending = Vec::new();
	for &i in &restart_indices {
		if i != index && guard.children[i].state == ChildState::Running {
			guard.children[i].stop.signal();
			pending.push((i, guard.children[i].generation, Deadline::after(guard.children[i].spec.shutdown_timeout)));
		}
	}
	drop(guard);
	await_children_stop(inner, exit_rx, pending);

	let mut guard = inner.lock();
	for i in restart_indices {
		let is_failed_child = i == index;
		let eligible = match guard.children[i].spec.policy {
			ChildPolicy::Permanent => true,
			ChildPolicy::Transient => !is_failed_child || crashed,
			ChildPolicy::Temporary => false,
		};
		if eligible {
			let generation = guard.children[i].generation + 1;
			let stop = StopToken::new();
			let child_fn = (guard.children[i].spec.factory)();
			let child_name = guard.children[i].spec.name.clone();
			let handle = spawn_child(i, generation, child_fn, stop.clone(), Arc::clone(exit_rx), &child_name);
			let child = &mut guard.children[i];
			child.generation = generation;
			child.stop = stop;
			child.handle = Some(handle);
			child.state = ChildState::Running;
		} else {
			guard.children[i].state = ChildState::Retired;
		}
	}
	info!("restart complete");
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	fn immediate(code: i32) -> impl Fn() -> ChildFn + Send + Sync + 'static {
		move || Box::new(move |_stop: StopToken| code) as ChildFn
	}

	fn crash_once(already_crashed: Arc<AtomicBool>) -> impl Fn() -> ChildFn + Send + Sync + 'static {
		move || {
			let already_crashed = Arc::clone(&already_crashed);
			Box::new(move |_stop: StopToken| {
				if !already_crashed.swap(true, Ordering::SeqCst) {
					panic!("induced crash");
				}
				0
			}) as ChildFn
		}
	}

	fn loops_until_stopped(ticks: Arc<AtomicUsize>) -> impl Fn() -> ChildFn + Send + Sync + 'static {
		move || {
			let ticks = Arc::clone(&ticks);
			Box::new(move |stop: StopToken| {
				while !stop.wait(Deadline::after(Duration::from_millis(5))) {
					ticks.fetch_add(1, Ordering::SeqCst);
				}
				0
			}) as ChildFn
		}
	}

	fn ignores_stop() -> impl Fn() -> ChildFn + Send + Sync + 'static {
		move || Box::new(move |_stop: StopToken| {
			std::thread::sleep(Duration::from_secs(5));
			0
		}) as ChildFn
	}

	#[test]
	fn one_for_one_restarts_only_the_crashed_child() {
		let crashed_a = Arc::new(AtomicBool::new(false));
		let restart_count_b = Arc::new(AtomicUsize::new(0));
		let restart_count_b2 = Arc::clone(&restart_count_b);
		let specs = vec![
			ChildSpec::new("a", Duration::from_millis(100), crash_once(Arc::clone(&crashed_a))),
			ChildSpec::new("b", Duration::from_millis(100), move || {
				restart_count_b2.fetch_add(1, Ordering::SeqCst);
				Box::new(|_stop: StopToken| 0) as ChildFn
			}),
		];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 5, Duration::from_secs(5));
		std::thread::sleep(Duration::from_millis(200));

		assert_eq!(sup.child_state("a"), Some(ChildState::Running));
		assert_eq!(restart_count_b.load(Ordering::SeqCst), 1, "sibling must not have been restarted");
		sup.stop();
	}

	#[test]
	fn rest_for_one_restarts_crashed_and_later_children_only() {
		let crashed_b = Arc::new(AtomicBool::new(false));
		let restart_count_a = Arc::new(AtomicUsize::new(0));
		let restart_count_a2 = Arc::clone(&restart_count_a);
		let restart_count_c = Arc::new(AtomicUsize::new(0));
		let restart_count_c2 = Arc::clone(&restart_count_c);

		let specs = vec![
			ChildSpec::new("a", Duration::from_millis(100), move || {
				restart_count_a2.fetch_add(1, Ordering::SeqCst);
				Box::new(|_stop: StopToken| 0) as ChildFn
			}),
			ChildSpec::new("b", Duration::from_millis(100), crash_once(Arc::clone(&crashed_b))),
			ChildSpec::new("c", Duration::from_millis(100), move || {
				restart_count_c2.fetch_add(1, Ordering::SeqCst);
				Box::new(|_stop: StopToken| 0) as ChildFn
			}),
		];
		let sup = Supervisor::start(specs, Strategy::RestForOne, 5, Duration::from_secs(5));
		std::thread::sleep(Duration::from_millis(250));

		assert_eq!(restart_count_a.load(Ordering::SeqCst), 1, "predecessor of the crashed child must not be restarted");
		assert!(restart_count_c.load(Ordering::SeqCst) >= 2, "successor of the crashed child must be rebuilt too");
		sup.stop();
	}

	#[test]
	fn escalates_after_exceeding_restart_intensity() {
		let specs = vec![ChildSpec::new("flaky", Duration::from_millis(100), || Box::new(|_stop: StopToken| panic!("induced crash")) as ChildFn)];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 2, Duration::from_secs(5));

		std::thread::sleep(Duration::from_millis(500));

		assert_eq!(sup.state(), SupervisorState::Crashed);
		sup.stop();
	}

	#[test]
	fn zero_max_restarts_means_unlimited() {
		// §4.8: "max_restarts ≤ 0 means unlimited." A child crashing
		// repeatedly inside a tiny window must never escalate when
		// `max_restarts == 0`.
		let build_count = Arc::new(AtomicUsize::new(0));
		let build_count2 = Arc::clone(&build_count);
		let specs = vec![ChildSpec::new("flaky", Duration::from_millis(100), move || {
			build_count2.fetch_add(1, Ordering::SeqCst);
			Box::new(|_stop: StopToken| panic!("induced crash")) as ChildFn
		})];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 0, Duration::from_millis(50));

		std::thread::sleep(Duration::from_millis(300));

		assert!(build_count.load(Ordering::SeqCst) >= 4, "an unlimited budget must survive many crashes within one short window");
		assert_eq!(sup.state(), SupervisorState::Running);
		sup.stop();
	}

	#[test]
	fn temporary_child_is_never_restarted_after_a_crash() {
		let specs = vec![ChildSpec::new("once", Duration::from_millis(100), || Box::new(|_stop: StopToken| panic!("temporary crashes once")) as ChildFn)
			.with_policy(ChildPolicy::Temporary)];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 10, Duration::from_secs(5));

		std::thread::sleep(Duration::from_millis(150));

		assert_eq!(sup.child_state("once"), Some(ChildState::Retired));
		sup.stop();
	}

	#[test]
	fn transient_child_is_not_restarted_on_its_own_normal_exit() {
		let specs = vec![ChildSpec::new("quits", Duration::from_millis(100), || Box::new(|_stop: StopToken| 0) as ChildFn).with_policy(ChildPolicy::Transient)];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 10, Duration::from_secs(5));

		std::thread::sleep(Duration::from_millis(150));

		assert_eq!(sup.child_state("quits"), Some(ChildState::Retired));
		sup.stop();
	}

	#[test]
	fn transient_child_returning_a_nonzero_status_is_treated_as_abnormal_and_restarted() {
		// A non-zero return is a failing exit per §4.8, not a normal one —
		// it must be restarted the same as a panic would be, not retired.
		let build_count = Arc::new(AtomicUsize::new(0));
		let build_count2 = Arc::clone(&build_count);
		let specs = vec![ChildSpec::new("fails", Duration::from_millis(100), move || {
			build_count2.fetch_add(1, Ordering::SeqCst);
			Box::new(|_stop: StopToken| 1) as ChildFn
		})
		.with_policy(ChildPolicy::Transient)];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 10, Duration::from_secs(5));

		std::thread::sleep(Duration::from_millis(150));

		assert!(build_count.load(Ordering::SeqCst) >= 2, "a transient child with a failing exit status must be restarted, not retired");
		assert_ne!(sup.child_state("fails"), Some(ChildState::Retired));
		sup.stop();
	}

	#[test]
	fn permanent_child_restarts_even_after_a_normal_exit() {
		let build_count = Arc::new(AtomicUsize::new(0));
		let build_count2 = Arc::clone(&build_count);
		let specs = vec![ChildSpec::new("loops", Duration::from_millis(100), move || {
			build_count2.fetch_add(1, Ordering::SeqCst);
			Box::new(|_stop: StopToken| 0) as ChildFn
		})];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 10, Duration::from_secs(5));

		std::thread::sleep(Duration::from_millis(200));

		assert!(build_count.load(Ordering::SeqCst) >= 2, "permanent child should have been rebuilt");
		sup.stop();
	}

	#[test]
	fn from_fn_clones_arg_fresh_on_every_restart() {
		let seen_args = Arc::new(Mutex::new(Vec::new()));
		let seen_args2 = Arc::clone(&seen_args);
		let specs = vec![ChildSpec::from_fn("worker", Duration::from_millis(100), 42usize, move |arg, _stop| {
			seen_args2.lock().push(arg);
			panic!("crash to trigger another restart");
		})
		.with_policy(ChildPolicy::Permanent)];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 10, Duration::from_secs(5));

		std::thread::sleep(Duration::from_millis(200));

		assert!(seen_args.lock().iter().all(|&a| a == 42));
		assert!(seen_args.lock().len() >= 2);
		sup.stop();
	}

	#[test]
	fn child_observes_stop_token_instead_of_being_abandoned() {
		let ticks = Arc::new(AtomicUsize::new(0));
		let specs = vec![ChildSpec::new("ticker", Duration::from_millis(200), loops_until_stopped(Arc::clone(&ticks)))];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 10, Duration::from_secs(5));

		std::thread::sleep(Duration::from_millis(60));
		sup.stop();

		assert_eq!(sup.child_state("ticker"), Some(ChildState::Exited(0)));
		assert!(ticks.load(Ordering::SeqCst) > 0);
	}

	#[test]
	fn stop_gives_up_on_a_child_that_ignores_its_stop_token() {
		let specs = vec![ChildSpec::new("stubborn", Duration::from_millis(50), ignores_stop())];
		let sup = Supervisor::start(specs, Strategy::OneForOne, 10, Duration::from_secs(5));

		let start = Instant::now();
		sup.stop();
		// `stop` must return promptly (bounded by shutdown_timeout), not hang
		// for the 5s the child actually sleeps.
		assert!(start.elapsed() < Duration::from_secs(1));
	}
}
