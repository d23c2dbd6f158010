//! Absolute monotonic deadlines (L1).
//!
//! A [`Deadline`] wraps a point on the process's monotonic clock. The
//! sentinel `Deadline::INFINITE` means "wait forever" everywhere a deadline
//! is accepted, so every blocking operation in this crate shares one
//! zero-vs-absolute-instant convention instead of each inventing its own.

use std::time::{Duration, Instant};

/// An absolute monotonic deadline, or the infinite sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
	/// The "wait forever" deadline.
	pub const INFINITE: Deadline = Deadline(None);

	/// A deadline `dur` from now.
	pub fn after(dur: Duration) -> Self {
		Deadline(Some(Instant::now() + dur))
	}

	/// A deadline at the given absolute instant.
	pub fn at(instant: Instant) -> Self {
		Deadline(Some(instant))
	}

	/// True if this deadline has no expiry.
	pub const fn is_infinite(self) -> bool {
		self.0.is_none()
	}

	/// Remaining duration until expiry, or `None` if infinite or already past.
	pub fn remaining(self) -> Option<Duration> {
		match self.0 {
			None => None,
			Some(at) => Some(at.saturating_duration_since(Instant::now())),
		}
	}

	/// True if `Instant::now()` is at or past this deadline.
	pub fn has_expired(self) -> bool {
		match self.0 {
			None => false,
			Some(at) => Instant::now() >= at,
		}
	}

	/// The earlier of two deadlines, treating `INFINITE` as "no bound".
	pub fn earliest(self, other: Deadline) -> Deadline {
		match (self.0, other.0) {
			(None, b) => Deadline(b),
			(a, None) => Deadline(a),
			(Some(a), Some(b)) => Deadline(Some(a.min(b))),
		}
	}

	pub(crate) fn instant(self) -> Option<Instant> {
		self.0
	}
}

impl Default for Deadline {
	fn default() -> Self {
		Deadline::INFINITE
	}
}
