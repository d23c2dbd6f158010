//! Construction-time knobs the runtime core itself owns (L9).
//!
//! The core never reads environment variables or global statics — see the
//! "no global mutable statics" rule in the crate's concurrency model. A host
//! binary assembles a [`RuntimeConfig`] from whatever CLI/env/file source it
//! likes (all of that is explicitly out of scope for this crate) and passes
//! it to the `_with_config` constructors; everything else keeps taking plain
//! arguments directly, so a caller that wants to skip configuration
//! entirely can still call e.g. `Pool::new(workers)` straight up.

use std::time::Duration;

/// Construction-time defaults for every component in the runtime.
///
/// Build one with [`RuntimeConfig::builder`], or use [`RuntimeConfig::default`]
/// to accept every default. Every field here has a direct counterpart
/// argument on the component it configures — `poll_slice` feeds
/// [`crate::reactor::EventLoop::spawn_with_config`],
/// `cooperative_poll_interval` feeds
/// [`crate::bridge::await_on_loop_with_config`] — so passing a `RuntimeConfig`
/// is always equivalent to passing its fields by hand.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
	/// Default actor mailbox capacity when a caller asks for the default
	/// instead of an explicit ring size (0 would mean unbounded).
	pub mailbox_capacity: usize,
	/// Default worker count for [`crate::pool::Pool`].
	pub pool_workers: usize,
	/// Upper bound on how long a single `EventLoop` `Poller::wait` call is
	/// allowed to block even with no timer registered, so a loop started
	/// with no work yet still wakes up periodically to notice new
	/// registrations applied without a prior `wake()` call racing it.
	pub poll_slice: Duration,
	/// Slice width used by [`crate::bridge::await_on_loop_with_config`]'s
	/// cooperative polling.
	pub cooperative_poll_interval: Duration,
	/// Default restart-intensity window for a [`crate::supervisor::Supervisor`].
	pub restart_window: Duration,
	/// Default restart-intensity ceiling within `restart_window`.
	pub max_restarts: usize,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			mailbox_capacity: 1024,
			pool_workers: default_worker_count(),
			poll_slice: Duration::from_millis(250),
			cooperative_poll_interval: Duration::from_millis(10),
			restart_window: Duration::from_secs(5),
			max_restarts: 3,
		}
	}
}

fn default_worker_count() -> usize {
	std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl RuntimeConfig {
	/// Starts a builder seeded with every default.
	pub fn builder() -> RuntimeConfigBuilder {
		RuntimeConfigBuilder {
			config: RuntimeConfig::default(),
		}
	}
}

/// Fluent builder for [`RuntimeConfig`]. Every setter takes `self` by value
/// so calls chain; `build()` returns the assembled config.
#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder {
	config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
	pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
		self.config.mailbox_capacity = capacity;
		self
	}

	pub fn pool_workers(mut self, workers: usize) -> Self {
		self.config.pool_workers = workers;
		self
	}

	pub fn poll_slice(mut self, slice: Duration) -> Self {
		self.config.poll_slice = slice;
		self
	}

	pub fn cooperative_poll_interval(mut self, interval: Duration) -> Self {
		self.config.cooperative_poll_interval = interval;
		self
	}

	pub fn restart_window(mut self, window: Duration) -> Self {
		self.config.restart_window = window;
		self
	}

	pub fn max_restarts(mut self, max: usize) -> Self {
		self.config.max_restarts = max;
		self
	}

	pub fn build(self) -> RuntimeConfig {
		self.config
	}
}
