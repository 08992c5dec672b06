//! # ATPneumatics Simulator
//!
//! Simulates the command/event/telemetry interface of the auxiliary
//! telescope pneumatics controller, standing in for the real hardware
//! during integration testing.
//!
//! ## Features
//!
//! - **Sequenced commands**: gapless sequence ids with ACK/NOACK/SUCCESS/FAIL
//!   responses
//! - **Timed actuators**: mirror covers and cell vents open and close on
//!   cancellable timers, with in-motion and settled events
//! - **Schema-checked messages**: every inbound and outbound payload is
//!   validated against a closed schema
//! - **Telemetry**: air line pressures, supply pressure and cell load sampled
//!   on a fixed period
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use atpneumatics::{PneumaticsServer, SimulatorConfig, SimulatorHandle};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SimulatorConfig::default();
//! let simulator = SimulatorHandle::from_config(config.clone())?;
//! let server = PneumaticsServer::bind(&config, simulator).await?;
//! server.run().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`simulator`] - Device state, command dispatch and lifecycle
//! - [`subsystems`] - Air valves and the timed cover/vent actuators
//! - [`protocol`] - Wire types and the message codec
//! - [`schema`] - Message schemas and their naming convention
//! - [`sequence`] - Command sequence id validation
//! - [`telemetry`] - Telemetry sampling loop
//! - [`server`] - TCP transport
//! - [`config`] - Configuration loading and validation

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod protocol;
pub mod schema;
pub mod sequence;
pub mod server;
pub mod simulator;
pub mod subsystems;
pub mod telemetry;

// Re-export main public types for convenience
pub use config::{DeviceConfig, SimulatorConfig};
pub use protocol::{Ack, Command, CommandResponse, Event, MessageCodec, Telemetry};
pub use server::PneumaticsServer;
pub use simulator::{PneumaticsSimulator, SimulatorHandle, SimulatorState, SimulatorStats};
