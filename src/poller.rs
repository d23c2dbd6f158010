//! Readiness multiplexing abstraction used by the event loop.
//!
//! [`Poller`] is the seam between the reactor's dispatch logic and the OS
//! readiness mechanism. The reactor is generic over it so the run loop,
//! timer sweep, and wake-pipe protocol can be exercised in tests against an
//! in-memory fake, while production code gets [`MioPoller`], backed by
//! `mio::Poll` (epoll/kqueue/IOCP depending on platform).

use std::io;
use std::time::Duration;

/// Readiness interest for a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
	pub readable: bool,
	pub writable: bool,
}

impl Interest {
	pub const READABLE: Interest = Interest {
		readable: true,
		writable: false,
	};
	pub const WRITABLE: Interest = Interest {
		readable: false,
		writable: true,
	};

	pub const fn combined(self, other: Interest) -> Interest {
		Interest {
			readable: self.readable || other.readable,
			writable: self.writable || other.writable,
		}
	}
}

/// A readiness event reported by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvent {
	pub tag: usize,
	pub readable: bool,
	pub writable: bool,
}

/// Abstraction over an OS readiness multiplexer (epoll/kqueue/IOCP).
///
/// Implementations must be single-owner: `add`/`modify`/`delete` and `wait`
/// are called only from the reactor thread that owns this poller, matching
/// the event loop's single-thread-owns-poll-state contract.
pub trait Poller: Send {
	/// Registers `fd` under `tag`, delivered back in readiness events.
	fn add(&mut self, fd: i32, tag: usize, interest: Interest) -> io::Result<()>;

	/// Changes the interest set for an already-registered `fd`.
	fn modify(&mut self, fd: i32, tag: usize, interest: Interest) -> io::Result<()>;

	/// Deregisters `fd`. A no-op if it was never registered.
	fn delete(&mut self, fd: i32) -> io::Result<()>;

	/// Blocks up to `timeout` (or forever if `None`) for readiness, appending
	/// observed events to `out`. Returns the number of events appended.
	fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadinessEvent>) -> io::Result<usize>;
}

/// Production [`Poller`] backed by `mio::Poll`.
pub struct MioPoller {
	poll: mio::Poll,
	events: mio::Events,
}

impl MioPoller {
	/// Creates a poller with room for up to `event_capacity` events per
	/// `wait` call.
	pub fn new(event_capacity: usize) -> io::Result<Self> {
		Ok(MioPoller {
			poll: mio::Poll::new()?,
			events: mio::Events::with_capacity(event_capacity.max(1)),
		})
	}

	fn mio_interest(interest: Interest) -> mio::Interest {
		match (interest.readable, interest.writable) {
			(true, true) => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
			(true, false) => mio::Interest::READABLE,
			(false, true) => mio::Interest::WRITABLE,
			(false, false) => mio::Interest::READABLE,
		}
	}
}

impl Poller for MioPoller {
	fn add(&mut self, fd: i32, tag: usize, interest: Interest) -> io::Result<()> {
		let mut source = mio::unix::SourceFd(&fd);
		self.poll
			.registry()
			.register(&mut source, mio::Token(tag), Self::mio_interest(interest))
	}

	fn modify(&mut self, fd: i32, tag: usize, interest: Interest) -> io::Result<()> {
		let mut source = mio::unix::SourceFd(&fd);
		self.poll
			.registry()
			.reregister(&mut source, mio::Token(tag), Self::mio_interest(interest))
	}

	fn delete(&mut self, fd: i32) -> io::Result<()> {
		let mut source = mio::unix::SourceFd(&fd);
		self.poll.registry().deregister(&mut source)
	}

	fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadinessEvent>) -> io::Result<usize> {
		self.poll.poll(&mut self.events, timeout)?;
		let mut count = 0;
		for event in self.events.iter() {
			out.push(ReadinessEvent {
				tag: event.token().0,
				readable: event.is_readable(),
				writable: event.is_writable(),
			});
			count += 1;
		}
		Ok(count)
	}
}

#[cfg(test)]
pub(crate) mod fake {
	//! An in-memory [`Poller`] used by reactor tests so they don't depend on
	//! real file descriptors.
	use super::*;
	use std::collections::HashMap;

	#[derive(Default)]
	pub struct FakePoller {
		registered: HashMap<i32, (usize, Interest)>,
		pending: Vec<ReadinessEvent>,
	}

	impl FakePoller {
		pub fn new() -> Self {
			Self::default()
		}

		/// Test hook: makes `wait` report this event on its next call.
		pub fn inject(&mut self, event: ReadinessEvent) {
			self.pending.push(event);
		}
	}

	impl Poller for FakePoller {
		fn add(&mut self, fd: i32, tag: usize, interest: Interest) -> io::Result<()> {
			self.registered.insert(fd, (tag, interest));
			Ok(())
		}

		fn modify(&mut self, fd: i32, tag: usize, interest: Interest) -> io::Result<()> {
			self.registered.insert(fd, (tag, interest));
			Ok(())
		}

		fn delete(&mut self, fd: i32) -> io::Result<()> {
			self.registered.remove(&fd);
			Ok(())
		}

		fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadinessEvent>) -> io::Result<usize> {
			let n = self.pending.len();
			out.append(&mut self.pending);
			if n == 0 {
				let cap = Duration::from_millis(5);
				std::thread::sleep(timeout.map_or(cap, |d| d.min(cap)));
			}
			Ok(n)
		}
	}
}
