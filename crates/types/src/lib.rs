//! Core types for the cosim middleware.
//!
//! This crate provides the foundational types used throughout the
//! participant runtime:
//!
//! - **Identifiers**: [`ParticipantId`], [`ServiceId`], [`EndpointAddress`]
//! - **Addressing**: [`ServiceDescriptor`], the full address of a service
//! - **Orchestration enums**: [`ParticipantState`], [`SystemState`]
//! - **Virtual time**: [`SimTime`], [`SimStep`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod descriptor;
mod identifiers;
mod state;
mod time;

pub use descriptor::{
    NetworkType, ServiceDescriptor, ServiceKey, ServiceType, SUPPLEMENTAL_KEY_HISTORY_LENGTH,
    SUPPLEMENTAL_KEY_LABELS, SUPPLEMENTAL_KEY_MEDIA_TYPE, SUPPLEMENTAL_KEY_PUBLISHER_UUID,
    SUPPLEMENTAL_KEY_RPC_FUNCTION,
};
pub use identifiers::{EndpointAddress, ParticipantId, ServiceId};
pub use state::{ParticipantState, SystemState};
pub use time::{SimStep, SimTime};
