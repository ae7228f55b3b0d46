//! Service discovery: who offers which service on which network.
//!
//! Each participant keeps two indexes:
//!
//! - a **local** index of services it created, keyed by
//!   (network name, service name), and
//! - a **remote** index of services announced by peers, keyed by the full
//!   [`ServiceKey`] triple.
//!
//! The remote index is append-only within a connection's lifetime: entries
//! leave only through an explicit `Removed` event from the owning peer, or
//! when that peer's link terminates.
//!
//! Both indexes sit behind one reader/writer lock. Discovery handlers are
//! never invoked under the lock — mutation methods return the handler
//! invocations to perform, and the dispatch thread runs them in
//! registration order.

mod index;

pub use index::{DiscoveryHandlerId, HandlerInvocation, ServiceDiscovery};
