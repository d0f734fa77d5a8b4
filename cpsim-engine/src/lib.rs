//! OCPP 1.6 charge-point simulator engine
//!
//! Simulates a single charge point talking OCPP 1.6-J to a CSMS over
//! WebSocket: boot handshake, heartbeats, connector state machine,
//! transactions with simulated meter values, and the CSMS-initiated
//! operations (RemoteStart/Stop, Reset, ChangeAvailability, configuration
//! management, UnlockConnector, TriggerMessage, ClearCache).
//!
//! The engine exposes no UI; a front end drives it through [`Simulator`]
//! and observes it through the [`events::EngineEvent`] feed.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod messages;
pub mod meter;
pub mod registry;
pub mod session;
pub mod station;
pub mod types;

pub use client::{EngineError, Simulator};
pub use config::SimulatorConfig;
pub use events::EngineEvent;
pub use messages::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
pub use registry::{ConfigurationEntry, ConfigurationRegistry};
pub use station::{Station, StationError, StatusChange, Transaction, TransactionState};
