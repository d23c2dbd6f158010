//! A single-process concurrent runtime: actors over a promise/future core,
//! a reactive event loop, a thread pool, and a supervision tree.
//!
//! The modules are layered bottom-up, each built only on the ones below it:
//!
//! - [`deadline`] — absolute monotonic deadlines shared by every blocking op.
//! - [`channel`] — bounded MPMC FIFO queue.
//! - [`promise`] — single-resolution promise/future core.
//! - [`pool`] — fixed-size worker thread pool.
//! - [`poller`] / [`reactor`] — readiness multiplexing and the event loop.
//! - [`bridge`] — adapts pool/loop work to the promise/future core, plus
//!   cooperative (non-blocking-the-loop) awaiting.
//! - [`actor`] — mailbox-driven actors with `tell`/`ask` and behavior swap.
//! - [`supervisor`] — restart policy and fault isolation over child actors.
//!
//! [`error`] carries the taxonomy used at every public fallible boundary.
//! [`config`] carries the few construction-time knobs the core owns
//! (mailbox/pool sizing, poll slices, restart-intensity defaults) — an
//! in-process builder, never a CLI or environment surface.

pub mod actor;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod deadline;
pub mod error;
pub mod poller;
pub mod pool;
pub mod promise;
pub mod reactor;
pub mod supervisor;

pub use actor::{ActorCell, ActorContext, ActorRef, ActorState, ActorStats, Behavior, Envelope};
pub use bridge::{await_future, await_on_loop, await_on_loop_with_config, promise_with_loop_wake, run, run_on_loop, run_on_loop_with_promise};
pub use channel::{Channel, TrySendError};
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use deadline::Deadline;
pub use error::{ErrorCode, Result, RuntimeError};
pub use poller::{Interest, MioPoller, Poller, ReadinessEvent};
pub use pool::Pool;
pub use promise::{Future, Promise, PromiseState, Snapshot, Wake};
pub use reactor::{EventLoop, IoCallback, IoToken, LoopWaker, TimerCallback, TimerToken};
pub use supervisor::{ChildPolicy, ChildSpec, Strategy, Supervisor, SupervisorState};
