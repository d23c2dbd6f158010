//! Error taxonomy shared across the runtime's subsystems.
//!
//! # Invariants
//!
//! 1. Every fallible public entry point returns a `RuntimeError`, never panics on
//!    caller-reachable misuse (an internal invariant break is still a `panic!`).
//!    - Enforced in: all `pub fn` boundaries in this crate.
//!    - Failure symptom: a caller mistake (e.g. awaiting a null handle) aborts the
//!      whole process instead of surfacing a recoverable error.

use std::fmt;

/// Sentinel error kinds shared across the core's public boundary.
///
/// Each variant's [`RuntimeError::sentinel`] maps onto a stable negative
/// integer (`-1` through `-6`, plus a caller-supplied crash status) for
/// callers that need to cross an FFI-style boundary where an enum can't.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
	/// Generic failure with no more specific classification.
	#[error("operation failed")]
	Failed,
	/// A non-blocking operation would have had to block.
	#[error("operation would block")]
	WouldBlock,
	/// A deadline passed before the operation completed.
	#[error("deadline expired")]
	Timeout,
	/// The target resource (channel, promise, actor, loop) is closed.
	#[error("resource closed")]
	Closed,
	/// A caller-supplied argument was invalid (null handle, bad alignment, etc).
	#[error("invalid argument")]
	InvalidArgument,
	/// A fixed-capacity allocation could not be satisfied.
	#[error("allocation failed")]
	NoMemory,
	/// An actor behavior or child function returned a negative/failure status.
	#[error("crashed with status {0}")]
	Crashed(i32),
}

impl RuntimeError {
	/// The stable negative-integer sentinel for this error kind.
	pub const fn sentinel(self) -> i32 {
		match self {
			RuntimeError::Failed => -1,
			RuntimeError::WouldBlock => -2,
			RuntimeError::Timeout => -3,
			RuntimeError::Closed => -4,
			RuntimeError::InvalidArgument => -5,
			RuntimeError::NoMemory => -6,
			RuntimeError::Crashed(code) => code,
		}
	}
}

/// Result alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// An integer error code carried by a rejected promise.
///
/// Kept distinct from [`RuntimeError`] because the promise core is generic
/// over opaque values and only ever carries a bare code — see
/// `promise::Promise::reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub i32);

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "error code {}", self.0)
	}
}

impl From<RuntimeError> for ErrorCode {
	fn from(err: RuntimeError) -> Self {
		ErrorCode(err.sentinel())
	}
}
