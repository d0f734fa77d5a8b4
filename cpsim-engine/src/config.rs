//! Simulator configuration

use std::time::Duration;

use crate::meter::MeterConfig;
use crate::registry::ConfigurationEntry;

/// Configuration for one simulated charge point
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// CSMS WebSocket base URL; the charge-point identity is appended as the
    /// last path segment
    pub csms_url: String,
    /// Charge-point identity, used in the URL path and logs
    pub identity: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Meter hardware description reported in BootNotification
    pub meter_type: Option<String>,
    pub meter_serial_number: Option<String>,
    /// HTTP basic auth credentials for the WebSocket handshake
    pub basic_auth: Option<(String, String)>,
    /// Number of connectors, ids 1..=n
    pub connector_count: u32,
    /// Initial HeartbeatInterval in seconds; the CSMS may override it at boot
    pub heartbeat_interval: u64,
    /// Maximum charging power in watts, reported via MaxChargingPower
    pub max_power_w: u32,
    /// Meter simulation parameters
    pub meter: MeterConfig,
    /// Extra configuration keys merged over the defaults
    pub custom_keys: Vec<ConfigurationEntry>,
    /// Initial reconnect backoff delay
    pub reconnect_delay: Duration,
    /// Backoff cap
    pub max_reconnect_delay: Duration,
    /// Per-call response timeout
    pub request_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:9000".to_string(),
            identity: "CP001".to_string(),
            vendor: "CPSim".to_string(),
            model: "CPSim-1.6".to_string(),
            serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            meter_type: None,
            meter_serial_number: None,
            basic_auth: None,
            connector_count: 1,
            heartbeat_interval: 60,
            max_power_w: 22_000,
            meter: MeterConfig::default(),
            custom_keys: Vec::new(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SimulatorConfig {
    /// Full WebSocket URL for this charge point.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.csms_url.trim_end_matches('/'),
            self.identity
        )
    }
}
