//! Engine event feed
//!
//! Broadcast stream consumed by a presentation layer (CLI, GUI). Slow or
//! absent subscribers never block the engine; `broadcast` drops the oldest
//! events when a receiver lags.

use crate::types::{ChargePointErrorCode, ChargePointStatus, ConfigurationStatus};

/// State changes and notable protocol events
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connecting,
    Connected,
    Disconnected,
    BootAccepted {
        heartbeat_interval: i64,
    },
    BootRejected,
    StatusChanged {
        connector_id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    },
    TransactionStarted {
        connector_id: u32,
        transaction_id: i64,
        id_tag: String,
    },
    TransactionStopped {
        connector_id: u32,
        transaction_id: i64,
        meter_stop: i64,
    },
    /// A StopTransaction sent after reconnect for a transaction whose stop
    /// was never acknowledged
    UnconfirmedStopResent {
        transaction_id: i64,
    },
    ConfigurationChanged {
        key: String,
        value: String,
        status: ConfigurationStatus,
    },
    HeartbeatAcknowledged,
    CallTimedOut {
        action: String,
    },
}
