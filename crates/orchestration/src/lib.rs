//! Orchestration: lifecycle, system aggregation, and virtual time.
//!
//! All three components are synchronous, deterministic state machines:
//!
//! ```text
//! Events → handle() → Actions
//! ```
//!
//! They perform no I/O and never block; the participant runtime delivers
//! events (user calls, peer messages, hook completions) and executes the
//! returned actions (emit a status, write a frame, invoke a user hook).
//! This keeps every ordering rule testable without a network.

mod lifecycle;
mod monitor;
mod time_sync;
mod watchdog;

pub use lifecycle::{
    HookKind, HookSet, LifecycleAction, LifecycleEvent, LifecycleStateMachine,
};
pub use monitor::SystemMonitor;
pub use time_sync::{TimeSyncAction, TimeSyncEvent, TimeSyncState};
pub use watchdog::{Watchdog, WatchdogConfig};
