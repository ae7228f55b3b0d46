//! The bootstrap registry: the first thing a participant dials.
//!
//! The registry validates announcements, keeps the domain roster, and
//! pushes [`KnownParticipants`] to every connected participant on join and
//! on every change. It never sees bus traffic; peers exchange that over
//! direct links.

mod server;

pub use server::{RegistryServer, RegistryServerError};

/// Exit codes shared by the domain utilities.
pub mod exit_codes {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Bad command-line arguments.
    pub const BAD_ARGUMENTS: i32 = -1;
    /// Configuration could not be loaded or validated.
    pub const CONFIGURATION_ERROR: i32 = -2;
    /// Runtime failure.
    pub const RUNTIME_ERROR: i32 = -3;
}
