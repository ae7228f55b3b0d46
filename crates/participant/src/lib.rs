//! The participant runtime: the component a simulation process embeds.
//!
//! A [`Participant`] joins a named simulation domain via the registry,
//! discovers peers, routes messages, advances the virtual clock in lockstep
//! with other synchronized participants, and walks the lifecycle state
//! machine with system-wide aggregation.
//!
//! # Threading
//!
//! One dedicated I/O task pair per peer link, one dispatch thread per
//! participant, plus the application's own threads calling the facade.
//! Every user-visible handler (frame received, service discovered,
//! participant status, simulation step) runs on the dispatch thread in
//! registration order; link tasks never run user code.
//!
//! ```no_run
//! use cosim_config::ParticipantConfiguration;
//! use cosim_participant::Participant;
//!
//! let mut config = ParticipantConfiguration::default();
//! config.participant_name = Some("EcuA".to_string());
//! let participant = Participant::connect(config)?;
//!
//! let can = participant.create_can_controller("CanCtrl", "CAN1")?;
//! can.add_frame_handler(|frame| println!("rx {:?} at {}", frame.payload, frame.timestamp));
//! can.send_frame(vec![0xde, 0xad]);
//! # Ok::<(), cosim_participant::ParticipantError>(())
//! ```

mod controllers;
mod core;
mod dispatch;
mod error;
mod lifecycle_service;
mod monitor_service;
mod participant;
mod system_controller;
mod time_provider;

pub use controllers::{
    BusController, DataMessageEvent, DataPublisher, DataSubscriber, FrameAckEvent, FrameEvent,
    Labels, RpcCallResultEvent, RpcClient, RpcServer,
};
pub use error::ParticipantError;
pub use lifecycle_service::LifecycleService;
pub use monitor_service::SystemMonitorHandle;
pub use participant::Participant;
pub use system_controller::SystemController;

// Re-exported so applications rarely need the leaf crates directly.
pub use cosim_config::ParticipantConfiguration;
pub use cosim_messages::{DiscoveryEventKind, LogLevel, ParticipantStatus, TransmitStatus};
pub use cosim_types::{ParticipantState, SimStep, SimTime, SystemState};
