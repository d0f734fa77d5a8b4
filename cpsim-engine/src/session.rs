//! Connection session state machine
//!
//! Tracks the transport lifecycle (Disconnected, Connecting, Connected,
//! Reconnecting), the boot handshake, and heartbeat scheduling. The
//! connector/transaction state lives in [`crate::station`]; this type only
//! knows whether the charge point is registered and when the next heartbeat
//! is due.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::SimulatorConfig;
use crate::types::BootNotificationRequest;

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events driving the session state machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connecting,
    Connected,
    /// BootNotification accepted; `interval` is the negotiated heartbeat
    /// period in seconds
    BootAccepted { interval: i64 },
    /// CSMS asked the charge point to retry booting later
    BootPending { interval: i64 },
    BootRejected,
    HeartbeatSent,
    /// Transport dropped; the reconnect loop takes over
    Dropped,
}

/// Session manager for one charge-point identity
#[derive(Debug)]
pub struct Session {
    pub identity: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub meter_type: Option<String>,
    pub meter_serial_number: Option<String>,

    pub state: SessionState,
    /// BootNotification was accepted on the current connection
    pub registered: bool,
    pub registered_at: Option<DateTime<Utc>>,
    /// Heartbeat period in seconds, negotiated at boot
    pub heartbeat_interval: i64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            vendor: config.vendor.clone(),
            model: config.model.clone(),
            serial_number: config.serial_number.clone(),
            firmware_version: config.firmware_version.clone(),
            meter_type: config.meter_type.clone(),
            meter_serial_number: config.meter_serial_number.clone(),
            state: SessionState::Disconnected,
            registered: false,
            registered_at: None,
            heartbeat_interval: config.heartbeat_interval as i64,
            last_heartbeat: None,
        }
    }

    /// Handle a session event
    pub fn handle_event(&mut self, event: SessionEvent) {
        debug!("session event: {:?}", event);

        match event {
            SessionEvent::Connecting => {
                self.state = if self.state == SessionState::Disconnected {
                    SessionState::Connecting
                } else {
                    SessionState::Reconnecting
                };
            }

            SessionEvent::Connected => {
                self.state = SessionState::Connected;
                info!("session connected, will send BootNotification");
            }

            SessionEvent::BootAccepted { interval } => {
                self.registered = true;
                self.registered_at = Some(Utc::now());
                if interval > 0 {
                    self.heartbeat_interval = interval;
                }
                self.last_heartbeat = None;
                info!(
                    "charge point registered, heartbeat interval {}s",
                    self.heartbeat_interval
                );
            }

            SessionEvent::BootPending { interval } => {
                self.registered = false;
                if interval > 0 {
                    self.heartbeat_interval = interval;
                }
                info!("boot pending, retry in {}s", self.heartbeat_interval);
            }

            SessionEvent::BootRejected => {
                self.registered = false;
                warn!("boot rejected by CSMS");
            }

            SessionEvent::HeartbeatSent => {
                self.last_heartbeat = Some(Utc::now());
            }

            SessionEvent::Dropped => {
                self.state = SessionState::Reconnecting;
                self.registered = false;
                self.registered_at = None;
                warn!("session dropped");
            }
        }
    }

    /// Heartbeat due check, valid only while registered.
    ///
    /// A heartbeat that times out does not alter the schedule; the next
    /// attempt fires one interval after the previous send.
    pub fn heartbeat_due(&self) -> bool {
        if !self.registered {
            return false;
        }

        match self.last_heartbeat {
            None => true,
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last);
                elapsed.num_seconds() >= self.heartbeat_interval
            }
        }
    }

    /// Build the BootNotification payload from the station identity.
    pub fn boot_notification_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_vendor: self.vendor.clone(),
            charge_point_model: self.model.clone(),
            charge_point_serial_number: self.serial_number.clone(),
            firmware_version: self.firmware_version.clone(),
            meter_type: self.meter_type.clone(),
            meter_serial_number: self.meter_serial_number.clone(),
        }
    }
}
