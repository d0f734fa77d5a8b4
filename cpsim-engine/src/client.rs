//! Simulator engine and WebSocket client
//!
//! Owns the connection to the CSMS and everything scheduled on top of it:
//! - WebSocket connect with the ocpp1.6 subprotocol and optional basic auth
//! - automatic reconnection with exponential backoff
//! - request/response correlation with per-call timeout
//! - BootNotification handshake, heartbeat loop, meter-value loops
//! - resend of StopTransaction calls that were lost to a disconnect
//!
//! All connector/transaction/configuration state sits behind one mutex, so
//! a local operator action and an inbound CSMS call can never interleave
//! partial updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        handshake::client::{generate_key, Request},
        http::{header, Uri},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::config::SimulatorConfig;
use crate::dispatch::{dispatch_call, FollowUp};
use crate::events::EngineEvent;
use crate::messages::*;
use crate::meter::{elapsed_since, parse_measurands, MeterGenerator};
use crate::registry::ConfigurationRegistry;
use crate::session::{Session, SessionEvent};
use crate::station::{Station, StationError, StatusChange, Transaction};
use crate::types::*;

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Errors surfaced to the operator API
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Station(#[from] StationError),

    #[error(transparent)]
    Ocpp(#[from] OcppError),
}

/// Pending request awaiting response
struct PendingCall {
    action: Action,
    response_tx: oneshot::Sender<Result<CallResult, OcppError>>,
}

/// State behind the single engine mutex
struct EngineState {
    station: Station,
    registry: ConfigurationRegistry,
    session: Session,
}

struct Inner {
    config: SimulatorConfig,
    state: Mutex<EngineState>,
    pending: RwLock<HashMap<String, PendingCall>>,
    outgoing_tx: mpsc::Sender<OcppMessage>,
    outgoing_rx: Mutex<mpsc::Receiver<OcppMessage>>,
    events: broadcast::Sender<EngineEvent>,
    meter: MeterGenerator,
    shutdown_tx: watch::Sender<bool>,
    /// Signalled by a Reset handler to tear the connection down
    reconnect: Notify,
}

/// One simulated OCPP 1.6 charge point
///
/// Cheap to clone; all clones share the same engine state.
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<Inner>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let mut registry = ConfigurationRegistry::new(
            config.heartbeat_interval,
            config.connector_count,
            config.max_power_w,
        );
        registry.load_custom_entries(config.custom_keys.iter().cloned());

        let state = EngineState {
            station: Station::new(config.connector_count),
            registry,
            session: Session::new(&config),
        };

        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        let meter = MeterGenerator::new(config.meter.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                pending: RwLock::new(HashMap::new()),
                outgoing_tx,
                outgoing_rx: Mutex::new(outgoing_rx),
                events,
                meter,
                shutdown_tx,
                reconnect: Notify::new(),
            }),
        }
    }

    /// Subscribe to the engine event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    // ------------------------------------------------------------------
    // Operator API
    // ------------------------------------------------------------------

    /// Start a transaction on a connector.
    ///
    /// Plugs the cable in when the connector is still `Available`, sends
    /// StartTransaction, and transitions to `Charging` once the CSMS
    /// accepts. Resolves with `InvalidState` before any frame is sent when
    /// the connector cannot start.
    pub async fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<i64, EngineError> {
        let started_at = Utc::now();

        let (plug_change, meter_start) = {
            let mut state = self.inner.state.lock().await;
            let change = state.station.plug_in(connector_id)?;
            let meter_start = state
                .station
                .start_pending(connector_id, id_tag, started_at)?;
            (change, meter_start)
        };

        if let Some(change) = plug_change {
            self.send_status_notification(change).await;
        }

        let call = Call::start_transaction(StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start,
            timestamp: started_at,
        })?;

        let response = match self.request(call).await {
            Ok(result) => result.parse_payload::<StartTransactionResponse>(),
            Err(e) => {
                let change = {
                    let mut state = self.inner.state.lock().await;
                    state.station.reject_start(connector_id)?
                };
                self.send_status_notification(change).await;
                return Err(e.into());
            }
        }?;

        if response.id_tag_info.status == AuthorizationStatus::Accepted {
            let change = {
                let mut state = self.inner.state.lock().await;
                state
                    .station
                    .confirm_start(connector_id, response.transaction_id)?
            };
            self.send_status_notification(change).await;
            self.emit(EngineEvent::TransactionStarted {
                connector_id,
                transaction_id: response.transaction_id,
                id_tag: id_tag.to_string(),
            });
            self.spawn_meter_loop(connector_id, response.transaction_id);
            Ok(response.transaction_id)
        } else {
            info!(
                "StartTransaction on connector {} not authorized: {:?}",
                connector_id, response.id_tag_info.status
            );
            let change = {
                let mut state = self.inner.state.lock().await;
                state.station.reject_start(connector_id)?
            };
            self.send_status_notification(change).await;
            Err(StationError::NoActiveTransaction(connector_id).into())
        }
    }

    /// Stop the active transaction on a connector.
    pub async fn stop_transaction(
        &self,
        connector_id: u32,
        reason: Reason,
    ) -> Result<(), EngineError> {
        let stopped_at = Utc::now();

        let (snapshot, change) = {
            let mut state = self.inner.state.lock().await;
            let meter_stop = state
                .station
                .active_transaction(connector_id)
                .map(|t| {
                    self.inner
                        .meter
                        .energy_wh(t.meter_start, elapsed_since(t.started_at))
                })
                .ok_or(StationError::NoActiveTransaction(connector_id))?;
            state
                .station
                .begin_stop(connector_id, meter_stop, stopped_at, reason)?
        };
        self.send_status_notification(change).await;

        let call = Call::stop_transaction(stop_request(&snapshot))?;
        self.request(call).await?;

        let change = {
            let mut state = self.inner.state.lock().await;
            state.station.finish_stop(connector_id)?
        };
        self.send_status_notification(change).await;
        self.emit(EngineEvent::TransactionStopped {
            connector_id,
            transaction_id: snapshot.id.unwrap_or_default(),
            meter_stop: snapshot.meter_stop.unwrap_or_default(),
        });

        Ok(())
    }

    /// Operator override of a connector status, reported to the CSMS.
    pub async fn set_connector_status(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    ) -> Result<(), EngineError> {
        let change = {
            let mut state = self.inner.state.lock().await;
            state.station.set_status(connector_id, status, error_code)?
        };
        self.send_status_notification(change).await;
        Ok(())
    }

    /// Local read of the configuration registry.
    pub async fn get_configuration(
        &self,
        keys: Option<&[String]>,
    ) -> (Vec<KeyValue>, Vec<String>) {
        let state = self.inner.state.lock().await;
        state.registry.snapshot(keys)
    }

    /// Local write to the configuration registry, same validation as
    /// ChangeConfiguration.
    pub async fn set_configuration(&self, key: &str, value: &str) -> ConfigurationStatus {
        let mut state = self.inner.state.lock().await;
        let status = state.registry.update(key, value);
        drop(state);
        self.emit(EngineEvent::ConfigurationChanged {
            key: key.to_string(),
            value: value.to_string(),
            status,
        });
        status
    }

    /// Current status of every connector.
    pub async fn connector_statuses(&self) -> Vec<StatusChange> {
        let state = self.inner.state.lock().await;
        state.station.status_changes()
    }

    /// Stop the engine: the run loop exits and all pending calls are
    /// cancelled with `ConnectionClosed`.
    pub fn disconnect(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.reconnect.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Correlation layer
    // ------------------------------------------------------------------

    /// Send a request and wait for the matching CALLRESULT.
    ///
    /// The pending entry is removed under the map lock by exactly one of
    /// the resolution path and the timeout path, never both.
    pub async fn request(&self, call: Call) -> Result<CallResult, OcppError> {
        let (response_tx, mut response_rx) = oneshot::channel();
        let unique_id = call.unique_id.clone();
        let action = call.action.clone();

        {
            let mut pending = self.inner.pending.write().await;
            pending.insert(
                unique_id.clone(),
                PendingCall {
                    action: action.clone(),
                    response_tx,
                },
            );
        }

        if let Err(e) = self.send_message(OcppMessage::Call(call)).await {
            self.inner.pending.write().await.remove(&unique_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.request_timeout, &mut response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => {
                let removed = self.inner.pending.write().await.remove(&unique_id);
                if removed.is_some() {
                    self.emit(EngineEvent::CallTimedOut {
                        action: action.to_string(),
                    });
                    Err(OcppError::Timeout)
                } else {
                    // the resolver won the race and completed the oneshot
                    // while holding the map lock
                    match response_rx.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(OcppError::ConnectionClosed),
                    }
                }
            }
        }
    }

    async fn send_message(&self, message: OcppMessage) -> Result<(), OcppError> {
        self.inner
            .outgoing_tx
            .send(message)
            .await
            .map_err(|_| OcppError::ConnectionClosed)
    }

    /// Resolve a pending call. The oneshot send happens under the map lock
    /// so the timeout path can rely on try_recv after a miss.
    async fn resolve_pending(&self, unique_id: &str, result: Result<CallResult, OcppError>) {
        let mut pending = self.inner.pending.write().await;
        match pending.remove(unique_id) {
            Some(call) => {
                debug!("resolving {} ({})", call.action, unique_id);
                let _ = call.response_tx.send(result);
            }
            None => {
                warn!("dropping response for unknown uniqueId {}", unique_id);
            }
        }
    }

    async fn cancel_pending(&self) {
        let mut pending = self.inner.pending.write().await;
        for (_, call) in pending.drain() {
            let _ = call.response_tx.send(Err(OcppError::ConnectionClosed));
        }
    }

    // ------------------------------------------------------------------
    // Protocol helpers
    // ------------------------------------------------------------------

    async fn send_status_notification(&self, change: StatusChange) {
        self.emit(EngineEvent::StatusChanged {
            connector_id: change.connector_id,
            status: change.status,
            error_code: change.error_code,
        });

        let call = match Call::status_notification(
            change.connector_id,
            change.status,
            change.error_code,
        ) {
            Ok(call) => call,
            Err(e) => {
                error!("failed to build StatusNotification: {}", e);
                return;
            }
        };

        if let Err(e) = self.request(call).await {
            warn!(
                "StatusNotification for connector {} failed: {}",
                change.connector_id, e
            );
        }
    }

    async fn send_boot_notification(&self) -> Result<BootNotificationResponse, OcppError> {
        let request = {
            let state = self.inner.state.lock().await;
            state.session.boot_notification_request()
        };

        let result = self.request(Call::boot_notification(request)?).await?;
        let response: BootNotificationResponse = result.parse_payload()?;

        let mut state = self.inner.state.lock().await;
        match response.status {
            RegistrationStatus::Accepted => {
                state.session.handle_event(SessionEvent::BootAccepted {
                    interval: response.interval,
                });
            }
            RegistrationStatus::Pending => {
                state.session.handle_event(SessionEvent::BootPending {
                    interval: response.interval,
                });
            }
            RegistrationStatus::Rejected => {
                state.session.handle_event(SessionEvent::BootRejected);
            }
        }

        Ok(response)
    }

    async fn send_heartbeat(&self) {
        let call = match Call::heartbeat() {
            Ok(call) => call,
            Err(e) => {
                error!("failed to build Heartbeat: {}", e);
                return;
            }
        };

        match self.request(call).await {
            Ok(result) => match result.parse_payload::<HeartbeatResponse>() {
                Ok(response) => {
                    debug!("heartbeat acknowledged at {}", response.current_time);
                    self.emit(EngineEvent::HeartbeatAcknowledged);
                }
                Err(e) => warn!("malformed Heartbeat response: {}", e),
            },
            Err(e) => warn!("heartbeat failed: {}", e),
        }
    }

    /// Send one MeterValues sample for a connector, outside the periodic
    /// loop (TriggerMessage).
    async fn send_meter_values_once(&self, connector_id: u32) {
        let (transaction, measurands) = {
            let state = self.inner.state.lock().await;
            let measurands = parse_measurands(
                state
                    .registry
                    .get("MeterValuesSampledData")
                    .unwrap_or("Energy.Active.Import.Register"),
            );
            let transaction = state
                .station
                .active_transaction(connector_id)
                .map(|t| (t.id, t.meter_start, t.started_at));
            (transaction, measurands)
        };

        if measurands.is_empty() {
            return;
        }

        let (transaction_id, meter_start, started_at) = match transaction {
            Some((id, start, at)) => (id, start, at),
            None => (None, 0, Utc::now()),
        };

        let meter_value = self.inner.meter.sample(
            meter_start,
            elapsed_since(started_at),
            &measurands,
            ReadingContext::Trigger,
        );

        match Call::meter_values(connector_id, transaction_id, vec![meter_value]) {
            Ok(call) => {
                if let Err(e) = self.request(call).await {
                    warn!("MeterValues for connector {} failed: {}", connector_id, e);
                }
            }
            Err(e) => error!("failed to build MeterValues: {}", e),
        }
    }

    /// Periodic meter samples while the transaction stays active.
    ///
    /// Interval and measurand set are re-read from the registry every
    /// cycle, so ChangeConfiguration takes effect without restarting the
    /// loop. Interval 0 disables sampling.
    fn spawn_meter_loop(
        &self,
        connector_id: u32,
        transaction_id: i64,
    ) -> tokio::task::JoinHandle<()> {
        let sim = self.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = sim.inner.shutdown_tx.subscribe();
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }

                let (interval, measurands, transaction) = {
                    let state = sim.inner.state.lock().await;
                    let interval = state.registry.get_int("MeterValueSampleInterval", 60);
                    let measurands = parse_measurands(
                        state
                            .registry
                            .get("MeterValuesSampledData")
                            .unwrap_or("Energy.Active.Import.Register"),
                    );
                    let transaction = state
                        .station
                        .active_transaction(connector_id)
                        .filter(|t| t.id == Some(transaction_id))
                        .map(|t| (t.meter_start, t.started_at));
                    (interval, measurands, transaction)
                };

                if interval <= 0 {
                    debug!(
                        "MeterValueSampleInterval is 0, stopping meter loop for connector {}",
                        connector_id
                    );
                    return;
                }
                if transaction.is_none() {
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval as u64)) => {}
                    _ = shutdown_rx.changed() => return,
                }

                let (meter_start, started_at) = {
                    let state = sim.inner.state.lock().await;
                    match state
                        .station
                        .active_transaction(connector_id)
                        .filter(|t| t.id == Some(transaction_id))
                    {
                        Some(t) => (t.meter_start, t.started_at),
                        None => return,
                    }
                };

                if measurands.is_empty() {
                    continue;
                }

                let meter_value = sim.inner.meter.sample(
                    meter_start,
                    elapsed_since(started_at),
                    &measurands,
                    ReadingContext::SamplePeriodic,
                );

                match Call::meter_values(connector_id, Some(transaction_id), vec![meter_value]) {
                    Ok(call) => {
                        if let Err(e) = sim.request(call).await {
                            warn!("meter loop for connector {} stopping: {}", connector_id, e);
                            return;
                        }
                    }
                    Err(e) => {
                        error!("failed to build MeterValues: {}", e);
                        return;
                    }
                }
            }
        })
    }

    /// Resend StopTransaction for every transaction whose stop was lost to
    /// a disconnect. Bounded retries with exponential backoff, driven by
    /// TransactionMessageAttempts and TransactionMessageRetryInterval.
    async fn resend_unconfirmed_stops(&self) {
        let (unconfirmed, attempts, base_delay) = {
            let mut state = self.inner.state.lock().await;
            let attempts = state.registry.get_int("TransactionMessageAttempts", 3).max(1);
            let base_delay = state
                .registry
                .get_int("TransactionMessageRetryInterval", 10)
                .max(0) as u64;
            (state.station.take_unconfirmed(), attempts, base_delay)
        };

        for transaction in unconfirmed {
            let sim = self.clone();
            tokio::spawn(async move {
                let transaction_id = transaction.id.unwrap_or_default();

                for attempt in 0..attempts {
                    let call = match Call::stop_transaction(stop_request(&transaction)) {
                        Ok(call) => call,
                        Err(e) => {
                            error!("failed to build StopTransaction resend: {}", e);
                            return;
                        }
                    };

                    match sim.request(call).await {
                        Ok(_) => {
                            info!("resent StopTransaction for transaction {}", transaction_id);
                            sim.emit(EngineEvent::UnconfirmedStopResent { transaction_id });
                            return;
                        }
                        Err(e) => {
                            warn!(
                                "StopTransaction resend attempt {} for transaction {} failed: {}",
                                attempt + 1,
                                transaction_id,
                                e
                            );
                            let delay = resend_delay(base_delay, attempt);
                            tokio::time::sleep(Duration::from_secs(delay)).await;
                        }
                    }
                }

                // give the next reconnect another chance
                let mut state = sim.inner.state.lock().await;
                state.station.requeue_unconfirmed(transaction);
            });
        }
    }

    // ------------------------------------------------------------------
    // Dispatch plumbing
    // ------------------------------------------------------------------

    async fn handle_inbound_call(&self, call: Call) {
        let outcome = {
            let mut state = self.inner.state.lock().await;
            let EngineState {
                station, registry, ..
            } = &mut *state;
            dispatch_call(&call, station, registry)
        };

        for event in outcome.events {
            self.emit(event);
        }

        if let Err(e) = self.send_message(outcome.response).await {
            error!("failed to queue response for {}: {}", call.action, e);
            return;
        }

        if !outcome.follow_ups.is_empty() {
            let sim = self.clone();
            tokio::spawn(async move {
                sim.execute_follow_ups(outcome.follow_ups).await;
            });
        }
    }

    async fn execute_follow_ups(&self, follow_ups: Vec<FollowUp>) {
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::StartTransaction {
                    connector_id,
                    id_tag,
                } => {
                    if let Err(e) = self.start_transaction(connector_id, &id_tag).await {
                        warn!(
                            "remote start on connector {} failed: {}",
                            connector_id, e
                        );
                    }
                }
                FollowUp::StopTransaction {
                    connector_id,
                    reason,
                } => {
                    if let Err(e) = self.stop_transaction(connector_id, reason).await {
                        warn!("stop on connector {} failed: {}", connector_id, e);
                    }
                }
                FollowUp::NotifyStatus(change) => {
                    self.send_status_notification(change).await;
                }
                FollowUp::SendBootNotification => match self.send_boot_notification().await {
                    Ok(response) => debug!("triggered boot: {:?}", response.status),
                    Err(e) => warn!("triggered BootNotification failed: {}", e),
                },
                FollowUp::SendHeartbeat => self.send_heartbeat().await,
                FollowUp::SendMeterValues { connector_id } => {
                    self.send_meter_values_once(connector_id).await;
                }
                FollowUp::Reset { kind } => self.perform_reset(kind).await,
            }
        }
    }

    /// Stop every active transaction with the matching reason, then drop
    /// the connection so the reconnect loop simulates the reboot.
    async fn perform_reset(&self, kind: ResetType) {
        let reason = match kind {
            ResetType::Hard => Reason::HardReset,
            ResetType::Soft => Reason::SoftReset,
        };

        let charging: Vec<u32> = {
            let state = self.inner.state.lock().await;
            state
                .station
                .connectors()
                .filter(|c| state.station.active_transaction(c.id).is_some())
                .map(|c| c.id)
                .collect()
        };

        for connector_id in charging {
            if let Err(e) = self.stop_transaction(connector_id, reason).await {
                warn!(
                    "reset: stopping connector {} failed: {}",
                    connector_id, e
                );
            }
        }

        info!("simulating {:?} reset, dropping connection", kind);
        self.inner.reconnect.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Connection loop
    // ------------------------------------------------------------------

    /// Run the connection loop until [`Simulator::disconnect`] is called.
    ///
    /// Reconnects with exponential backoff on every transport failure.
    pub async fn run(&self) -> Result<(), OcppError> {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut reconnect_delay = self.inner.config.reconnect_delay;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            info!("connecting to CSMS: {}", self.inner.config.endpoint());
            {
                let mut state = self.inner.state.lock().await;
                state.session.handle_event(SessionEvent::Connecting);
            }
            self.emit(EngineEvent::Connecting);

            match self.connect_and_run(&mut shutdown_rx).await {
                Ok(()) => {
                    info!("connection closed gracefully");
                    break;
                }
                Err(e) => {
                    error!("connection error: {}", e);
                    self.on_connection_lost().await;

                    info!("reconnecting in {:?}", reconnect_delay);
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    reconnect_delay =
                        std::cmp::min(reconnect_delay * 2, self.inner.config.max_reconnect_delay);
                }
            }
        }

        self.cancel_pending().await;
        Ok(())
    }

    /// Transport dropped: fail pending calls, close live transactions as
    /// unconfirmed so their stop can be resent after reconnect.
    async fn on_connection_lost(&self) {
        self.cancel_pending().await;

        let mut state = self.inner.state.lock().await;
        state.session.handle_event(SessionEvent::Dropped);
        let meter = &self.inner.meter;
        state.station.close_unconfirmed(Reason::Other, |t| {
            meter.energy_wh(t.meter_start, elapsed_since(t.started_at))
        });
        drop(state);

        self.emit(EngineEvent::Disconnected);
    }

    async fn connect_and_run(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), OcppError> {
        let url = self.inner.config.endpoint();
        let uri: Uri = url.parse().map_err(|_| OcppError::InvalidFormat)?;

        let mut request = Request::builder()
            .uri(&url)
            .header(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL)
            .header(header::HOST, uri.host().unwrap_or("localhost"))
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, generate_key());

        if let Some((user, password)) = &self.inner.config.basic_auth {
            let credentials = BASE64.encode(format!("{user}:{password}"));
            request = request.header(header::AUTHORIZATION, format!("Basic {credentials}"));
        }

        let request = request.body(()).map_err(|_| OcppError::InvalidFormat)?;

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| {
                error!("WebSocket connection failed: {}", e);
                OcppError::ConnectionClosed
            })?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());

        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "CSMS did not accept the ocpp1.6 subprotocol, got: {:?}",
                accepted_protocol
            );
        }

        info!("WebSocket connected to {}", url);

        {
            let mut state = self.inner.state.lock().await;
            state.session.handle_event(SessionEvent::Connected);
        }
        self.emit(EngineEvent::Connected);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Writer task drains the shared outgoing queue for the lifetime of
        // this connection.
        let writer = {
            let sim = self.clone();
            tokio::spawn(async move {
                let mut outgoing = sim.inner.outgoing_rx.lock().await;
                while let Some(msg) = outgoing.recv().await {
                    let bytes = match msg.to_bytes() {
                        Ok(b) => b,
                        Err(e) => {
                            error!("failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    debug!("sending: {}", text);
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        error!("failed to send WebSocket message: {}", e);
                        break;
                    }
                }
            })
        };

        // Boot handshake and the post-boot sweep run concurrently with the
        // read loop, since both need it to resolve their calls.
        let booter = {
            let sim = self.clone();
            tokio::spawn(async move {
                sim.boot_until_registered().await;
            })
        };

        let result = self.read_loop(&mut ws_rx, shutdown_rx).await;

        booter.abort();
        writer.abort();
        result
    }

    /// Boot, retrying on Pending/Rejected, then announce connector
    /// statuses and resend unconfirmed stops.
    async fn boot_until_registered(&self) {
        loop {
            match self.send_boot_notification().await {
                Ok(response) => match response.status {
                    RegistrationStatus::Accepted => {
                        self.emit(EngineEvent::BootAccepted {
                            heartbeat_interval: response.interval,
                        });
                        for change in self.connector_statuses().await {
                            self.send_status_notification(change).await;
                        }
                        self.resend_unconfirmed_stops().await;
                        return;
                    }
                    RegistrationStatus::Pending | RegistrationStatus::Rejected => {
                        if response.status == RegistrationStatus::Rejected {
                            self.emit(EngineEvent::BootRejected);
                        }
                        let wait = if response.interval > 0 {
                            response.interval as u64
                        } else {
                            self.inner.config.heartbeat_interval
                        };
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                    }
                },
                Err(e) => {
                    warn!("BootNotification failed: {}", e);
                    tokio::time::sleep(self.inner.config.reconnect_delay).await;
                }
            }
        }
    }

    async fn read_loop<S>(
        &self,
        ws_rx: &mut S,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), OcppError>
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("received: {}", text);
                            self.handle_frame(text.as_bytes()).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by server");
                            return Err(OcppError::ConnectionClosed);
                        }
                        Some(Ok(Message::Ping(_))) => {
                            debug!("received ping");
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            return Err(OcppError::ConnectionClosed);
                        }
                        None => {
                            info!("WebSocket stream ended");
                            return Err(OcppError::ConnectionClosed);
                        }
                        _ => {}
                    }
                }

                // Heartbeats fire as their own tasks so a slow CSMS cannot
                // stall the read loop.
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let due = {
                        let mut state = self.inner.state.lock().await;
                        if state.session.heartbeat_due() {
                            state.session.handle_event(SessionEvent::HeartbeatSent);
                            true
                        } else {
                            false
                        }
                    };
                    if due {
                        let sim = self.clone();
                        tokio::spawn(async move { sim.send_heartbeat().await });
                    }
                }

                _ = self.inner.reconnect.notified() => {
                    return Err(OcppError::ConnectionClosed);
                }

                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        match OcppMessage::parse(bytes) {
            Ok(OcppMessage::Call(call)) => {
                self.handle_inbound_call(call).await;
            }
            Ok(OcppMessage::CallResult(result)) => {
                let unique_id = result.unique_id.clone();
                self.resolve_pending(&unique_id, Ok(result)).await;
            }
            Ok(OcppMessage::CallError(error)) => {
                let unique_id = error.unique_id.clone();
                self.resolve_pending(
                    &unique_id,
                    Err(OcppError::RemoteError {
                        code: error.error_code,
                        description: error.error_description,
                        details: error.error_details,
                    }),
                )
                .await;
            }
            Err(OcppError::UnknownAction { message_id, action }) => {
                warn!("unknown action {} (uniqueId {})", action, message_id);
                let response = CallError::new(
                    message_id,
                    ErrorCode::NotImplemented,
                    format!("action {action} is not implemented"),
                );
                if let Err(e) = self.send_message(OcppMessage::CallError(response)).await {
                    error!("failed to queue NotImplemented error: {}", e);
                }
            }
            Err(e) => {
                warn!("failed to parse OCPP message: {}", e);
            }
        }
    }
}

/// Exponential resend backoff in seconds. The exponent is clamped so an
/// operator-configured attempt count cannot overflow the shift.
fn resend_delay(base_delay: u64, attempt: i64) -> u64 {
    let exp = u32::try_from(attempt).unwrap_or(u32::MAX).min(16);
    base_delay.saturating_mul(1u64 << exp)
}

fn stop_request(transaction: &Transaction) -> StopTransactionRequest {
    StopTransactionRequest {
        transaction_id: transaction.id.unwrap_or_default(),
        meter_stop: transaction.meter_stop.unwrap_or(transaction.meter_start),
        timestamp: transaction.stopped_at.unwrap_or_else(Utc::now),
        id_tag: Some(transaction.id_tag.clone()),
        reason: transaction.stop_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_request_falls_back_to_meter_start() {
        let transaction = Transaction {
            id: Some(7),
            connector_id: 1,
            id_tag: "TAG".into(),
            meter_start: 120,
            started_at: Utc::now(),
            state: crate::station::TransactionState::Active,
            meter_stop: None,
            stopped_at: None,
            stop_reason: None,
        };

        let req = stop_request(&transaction);
        assert_eq!(req.transaction_id, 7);
        assert_eq!(req.meter_stop, 120);
        assert_eq!(req.id_tag.as_deref(), Some("TAG"));
    }

    #[test]
    fn test_resend_delay_clamps_exponent() {
        assert_eq!(resend_delay(10, 0), 10);
        assert_eq!(resend_delay(10, 2), 40);
        // huge attempt counts saturate instead of overflowing the shift
        assert_eq!(resend_delay(10, 1_000), 10 * (1 << 16));
        assert_eq!(resend_delay(u64::MAX, 3), u64::MAX);
    }

    #[tokio::test]
    async fn test_meter_loop_stops_on_disconnect() {
        let sim = Simulator::new(SimulatorConfig::default());
        {
            let mut state = sim.inner.state.lock().await;
            state.station.plug_in(1).unwrap();
            state.station.start_pending(1, "TAG", Utc::now()).unwrap();
            state.station.confirm_start(1, 7).unwrap();
        }

        // default MeterValueSampleInterval is 60s, so without the shutdown
        // signal the loop would still be sleeping
        let handle = sim.spawn_meter_loop(1, 7);
        sim.disconnect();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("meter loop kept running after disconnect")
            .unwrap();
    }
}
