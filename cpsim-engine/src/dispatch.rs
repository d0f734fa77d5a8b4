//! Inbound CSMS call dispatch
//!
//! Routes each CSMS-initiated CALL to the state machine or configuration
//! registry and builds the response frame. Handlers never touch the wire:
//! the caller sends the returned response and executes the follow-up
//! actions, so the read loop is never blocked waiting on its own outbound
//! requests.
//!
//! Error mapping per action payload:
//! - malformed payload: CALLERROR FormationViolation
//! - connector id outside the known set: CALLERROR PropertyConstraintViolation
//! - action not in the closed set: CALLERROR NotImplemented (handled by the
//!   caller from the parse error)

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::events::EngineEvent;
use crate::messages::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
use crate::registry::ConfigurationRegistry;
use crate::station::{Station, StatusChange};
use crate::types::*;

/// Deferred work the session executes after the response frame is sent
#[derive(Debug, Clone)]
pub enum FollowUp {
    StartTransaction { connector_id: u32, id_tag: String },
    StopTransaction { connector_id: u32, reason: Reason },
    NotifyStatus(StatusChange),
    SendBootNotification,
    SendHeartbeat,
    SendMeterValues { connector_id: u32 },
    Reset { kind: ResetType },
}

/// Result of handling one inbound CALL
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: OcppMessage,
    pub follow_ups: Vec<FollowUp>,
    pub events: Vec<EngineEvent>,
}

impl DispatchOutcome {
    fn result(
        unique_id: &str,
        payload: impl serde::Serialize,
    ) -> Result<Self, OcppError> {
        Ok(Self {
            response: OcppMessage::CallResult(CallResult::new(unique_id.to_string(), payload)?),
            follow_ups: Vec::new(),
            events: Vec::new(),
        })
    }

    fn error(unique_id: &str, code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            response: OcppMessage::CallError(CallError::new(
                unique_id.to_string(),
                code,
                description,
            )),
            follow_ups: Vec::new(),
            events: Vec::new(),
        }
    }

    fn with_follow_ups(mut self, follow_ups: Vec<FollowUp>) -> Self {
        self.follow_ups = follow_ups;
        self
    }

    fn with_events(mut self, events: Vec<EngineEvent>) -> Self {
        self.events = events;
        self
    }
}

/// Handle one inbound CSMS call against the locked engine state.
pub fn dispatch_call(
    call: &Call,
    station: &mut Station,
    registry: &mut ConfigurationRegistry,
) -> DispatchOutcome {
    let outcome = match call.action {
        Action::RemoteStartTransaction => handle_remote_start(call, station),
        Action::RemoteStopTransaction => handle_remote_stop(call, station),
        Action::Reset => handle_reset(call),
        Action::ChangeAvailability => handle_change_availability(call, station),
        Action::ChangeConfiguration => handle_change_configuration(call, registry),
        Action::GetConfiguration => handle_get_configuration(call, registry),
        Action::UnlockConnector => handle_unlock_connector(call, station),
        Action::TriggerMessage => handle_trigger_message(call, station),
        Action::ClearCache => handle_clear_cache(call),
        // CP-to-CSMS actions are not valid inbound
        _ => Ok(DispatchOutcome::error(
            &call.unique_id,
            ErrorCode::NotImplemented,
            format!("{} is not handled by the charge point", call.action),
        )),
    };

    outcome.unwrap_or_else(|e| {
        warn!("failed to build response for {}: {}", call.action, e);
        DispatchOutcome::error(&call.unique_id, ErrorCode::InternalError, e.to_string())
    })
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|e| e.to_string())
}

fn handle_remote_start(
    call: &Call,
    station: &mut Station,
) -> Result<DispatchOutcome, OcppError> {
    let req: RemoteStartTransactionRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    // an omitted connectorId targets the first connector able to start
    let connector_id = match req.connector_id {
        Some(id) => {
            if station.connector(id).is_err() {
                return Ok(DispatchOutcome::error(
                    &call.unique_id,
                    ErrorCode::PropertyConstraintViolation,
                    format!("unknown connector {id}"),
                ));
            }
            id
        }
        None => match station
            .connectors()
            .find(|c| can_start(c.status) && c.transaction().is_none())
            .map(|c| c.id)
        {
            Some(id) => id,
            None => {
                return DispatchOutcome::result(
                    &call.unique_id,
                    RemoteStartTransactionResponse {
                        status: RemoteStartStopStatus::Rejected,
                    },
                )
            }
        },
    };

    let connector = station
        .connector(connector_id)
        .map_err(<serde_json::Error as serde::de::Error>::custom)?;
    let startable = can_start(connector.status) && connector.transaction().is_none();

    if !startable {
        info!(
            "RemoteStartTransaction rejected, connector {} is {}",
            connector_id, connector.status
        );
        return DispatchOutcome::result(
            &call.unique_id,
            RemoteStartTransactionResponse {
                status: RemoteStartStopStatus::Rejected,
            },
        );
    }

    DispatchOutcome::result(
        &call.unique_id,
        RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        },
    )
    .map(|o| {
        o.with_follow_ups(vec![FollowUp::StartTransaction {
            connector_id,
            id_tag: req.id_tag,
        }])
    })
}

fn can_start(status: ChargePointStatus) -> bool {
    matches!(
        status,
        ChargePointStatus::Available | ChargePointStatus::Preparing
    )
}

fn handle_remote_stop(
    call: &Call,
    station: &mut Station,
) -> Result<DispatchOutcome, OcppError> {
    let req: RemoteStopTransactionRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    match station.connector_of_transaction(req.transaction_id) {
        Some(connector_id) => DispatchOutcome::result(
            &call.unique_id,
            RemoteStopTransactionResponse {
                status: RemoteStartStopStatus::Accepted,
            },
        )
        .map(|o| {
            o.with_follow_ups(vec![FollowUp::StopTransaction {
                connector_id,
                reason: Reason::Remote,
            }])
        }),
        None => {
            info!(
                "RemoteStopTransaction rejected, unknown transaction {}",
                req.transaction_id
            );
            DispatchOutcome::result(
                &call.unique_id,
                RemoteStopTransactionResponse {
                    status: RemoteStartStopStatus::Rejected,
                },
            )
        }
    }
}

fn handle_reset(call: &Call) -> Result<DispatchOutcome, OcppError> {
    let req: ResetRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    info!("{:?} reset requested", req.kind);
    DispatchOutcome::result(
        &call.unique_id,
        ResetResponse {
            status: ResetStatus::Accepted,
        },
    )
    .map(|o| o.with_follow_ups(vec![FollowUp::Reset { kind: req.kind }]))
}

fn handle_change_availability(
    call: &Call,
    station: &mut Station,
) -> Result<DispatchOutcome, OcppError> {
    let req: ChangeAvailabilityRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    // connector 0 addresses the whole charge point
    let targets: Vec<u32> = if req.connector_id == 0 {
        station.connectors().map(|c| c.id).collect()
    } else if station.connector(req.connector_id).is_ok() {
        vec![req.connector_id]
    } else {
        return Ok(DispatchOutcome::error(
            &call.unique_id,
            ErrorCode::PropertyConstraintViolation,
            format!("unknown connector {}", req.connector_id),
        ));
    };

    let mut status = AvailabilityStatus::Accepted;
    let mut follow_ups = Vec::new();
    let mut events = Vec::new();

    for id in targets {
        let (connector_status, change) = station
            .change_availability(id, req.kind)
            .map_err(<serde_json::Error as serde::de::Error>::custom)?;
        if connector_status == AvailabilityStatus::Scheduled {
            status = AvailabilityStatus::Scheduled;
        }
        if let Some(change) = change {
            follow_ups.push(FollowUp::NotifyStatus(change));
            events.push(EngineEvent::StatusChanged {
                connector_id: change.connector_id,
                status: change.status,
                error_code: change.error_code,
            });
        }
    }

    DispatchOutcome::result(&call.unique_id, ChangeAvailabilityResponse { status })
        .map(|o| o.with_follow_ups(follow_ups).with_events(events))
}

fn handle_change_configuration(
    call: &Call,
    registry: &mut ConfigurationRegistry,
) -> Result<DispatchOutcome, OcppError> {
    let req: ChangeConfigurationRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    let status = registry.update(&req.key, &req.value);
    info!(
        "ChangeConfiguration {} = {:?}: {:?}",
        req.key, req.value, status
    );

    DispatchOutcome::result(&call.unique_id, ChangeConfigurationResponse { status }).map(|o| {
        o.with_events(vec![EngineEvent::ConfigurationChanged {
            key: req.key,
            value: req.value,
            status,
        }])
    })
}

fn handle_get_configuration(
    call: &Call,
    registry: &ConfigurationRegistry,
) -> Result<DispatchOutcome, OcppError> {
    let req: GetConfigurationRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    let (known, unknown) = registry.snapshot(req.key.as_deref());

    DispatchOutcome::result(
        &call.unique_id,
        GetConfigurationResponse {
            configuration_key: Some(known),
            unknown_key: if unknown.is_empty() {
                None
            } else {
                Some(unknown)
            },
        },
    )
}

fn handle_unlock_connector(
    call: &Call,
    station: &mut Station,
) -> Result<DispatchOutcome, OcppError> {
    let req: UnlockConnectorRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    if station.connector(req.connector_id).is_err() {
        return Ok(DispatchOutcome::error(
            &call.unique_id,
            ErrorCode::PropertyConstraintViolation,
            format!("unknown connector {}", req.connector_id),
        ));
    }

    // unlocking mid-transaction stops the transaction first
    let follow_ups = if station.active_transaction(req.connector_id).is_some() {
        vec![FollowUp::StopTransaction {
            connector_id: req.connector_id,
            reason: Reason::UnlockCommand,
        }]
    } else {
        Vec::new()
    };

    DispatchOutcome::result(
        &call.unique_id,
        UnlockConnectorResponse {
            status: UnlockStatus::Unlocked,
        },
    )
    .map(|o| o.with_follow_ups(follow_ups))
}

fn handle_trigger_message(
    call: &Call,
    station: &Station,
) -> Result<DispatchOutcome, OcppError> {
    let req: TriggerMessageRequest = match parse(&call.payload) {
        Ok(req) => req,
        Err(e) => {
            return Ok(DispatchOutcome::error(
                &call.unique_id,
                ErrorCode::FormationViolation,
                e,
            ))
        }
    };

    let connector_id = req.connector_id.unwrap_or(1);
    if station.connector(connector_id).is_err() {
        return Ok(DispatchOutcome::error(
            &call.unique_id,
            ErrorCode::PropertyConstraintViolation,
            format!("unknown connector {connector_id}"),
        ));
    }

    let accepted = |follow_ups: Vec<FollowUp>| {
        DispatchOutcome::result(
            &call.unique_id,
            TriggerMessageResponse {
                status: TriggerMessageStatus::Accepted,
            },
        )
        .map(|o| o.with_follow_ups(follow_ups))
    };

    match req.requested_message {
        MessageTrigger::BootNotification => accepted(vec![FollowUp::SendBootNotification]),
        MessageTrigger::Heartbeat => accepted(vec![FollowUp::SendHeartbeat]),
        MessageTrigger::StatusNotification => {
            let connector = station
                .connector(connector_id)
                .map_err(<serde_json::Error as serde::de::Error>::custom)?;
            accepted(vec![FollowUp::NotifyStatus(StatusChange {
                connector_id,
                status: connector.status,
                error_code: connector.error_code,
            })])
        }
        MessageTrigger::MeterValues => accepted(vec![FollowUp::SendMeterValues { connector_id }]),
        MessageTrigger::DiagnosticsStatusNotification
        | MessageTrigger::FirmwareStatusNotification => DispatchOutcome::result(
            &call.unique_id,
            TriggerMessageResponse {
                status: TriggerMessageStatus::NotImplemented,
            },
        ),
    }
}

fn handle_clear_cache(call: &Call) -> Result<DispatchOutcome, OcppError> {
    DispatchOutcome::result(
        &call.unique_id,
        ClearCacheResponse {
            status: ClearCacheStatus::Accepted,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn call(action: Action, payload: serde_json::Value) -> Call {
        Call {
            unique_id: "test-1".to_string(),
            action,
            payload,
        }
    }

    fn assert_error(outcome: &DispatchOutcome, code: ErrorCode) {
        match &outcome.response {
            OcppMessage::CallError(e) => assert_eq!(e.error_code, code),
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    fn result_payload(outcome: &DispatchOutcome) -> &Value {
        match &outcome.response {
            OcppMessage::CallResult(r) => {
                assert_eq!(r.unique_id, "test-1");
                &r.payload
            }
            other => panic!("expected CallResult, got {other:?}"),
        }
    }

    fn charging_station() -> Station {
        let mut station = Station::new(2);
        station.plug_in(1).unwrap();
        station.start_pending(1, "TAG123", Utc::now()).unwrap();
        station.confirm_start(1, 555).unwrap();
        station
    }

    #[test]
    fn test_malformed_payload_is_formation_violation() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(
            Action::RemoteStartTransaction,
            serde_json::json!({"connectorId": "one"}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);
        assert_error(&outcome, ErrorCode::FormationViolation);
        assert!(outcome.follow_ups.is_empty());
    }

    #[test]
    fn test_remote_start_unknown_connector() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(
            Action::RemoteStartTransaction,
            serde_json::json!({"idTag": "TAG1", "connectorId": 7}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);
        assert_error(&outcome, ErrorCode::PropertyConstraintViolation);
    }

    #[test]
    fn test_remote_start_accepted_with_follow_up() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(
            Action::RemoteStartTransaction,
            serde_json::json!({"idTag": "TAG1"}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);

        assert_eq!(result_payload(&outcome)["status"], "Accepted");
        assert!(matches!(
            outcome.follow_ups.as_slice(),
            [FollowUp::StartTransaction {
                connector_id: 1,
                ..
            }]
        ));
    }

    #[test]
    fn test_remote_start_rejected_while_charging() {
        let mut station = charging_station();
        let mut registry = ConfigurationRegistry::new(60, 2, 22000);

        let call = call(
            Action::RemoteStartTransaction,
            serde_json::json!({"idTag": "TAG1", "connectorId": 1}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);

        assert_eq!(result_payload(&outcome)["status"], "Rejected");
        assert!(outcome.follow_ups.is_empty());
    }

    #[test]
    fn test_remote_stop() {
        let mut station = charging_station();
        let mut registry = ConfigurationRegistry::new(60, 2, 22000);

        let accepted = call(
            Action::RemoteStopTransaction,
            serde_json::json!({"transactionId": 555}),
        );
        let outcome = dispatch_call(&accepted, &mut station, &mut registry);
        assert_eq!(result_payload(&outcome)["status"], "Accepted");
        assert!(matches!(
            outcome.follow_ups.as_slice(),
            [FollowUp::StopTransaction {
                connector_id: 1,
                reason: Reason::Remote,
            }]
        ));

        let rejected = call(
            Action::RemoteStopTransaction,
            serde_json::json!({"transactionId": 999}),
        );
        let outcome = dispatch_call(&rejected, &mut station, &mut registry);
        assert_eq!(result_payload(&outcome)["status"], "Rejected");
        assert!(outcome.follow_ups.is_empty());
    }

    #[test]
    fn test_reset_accepted() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(Action::Reset, serde_json::json!({"type": "Hard"}));
        let outcome = dispatch_call(&call, &mut station, &mut registry);

        assert_eq!(result_payload(&outcome)["status"], "Accepted");
        assert!(matches!(
            outcome.follow_ups.as_slice(),
            [FollowUp::Reset {
                kind: ResetType::Hard
            }]
        ));
    }

    #[test]
    fn test_change_availability_scheduled_mid_transaction() {
        let mut station = charging_station();
        let mut registry = ConfigurationRegistry::new(60, 2, 22000);

        let call = call(
            Action::ChangeAvailability,
            serde_json::json!({"connectorId": 1, "type": "Inoperative"}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);
        assert_eq!(result_payload(&outcome)["status"], "Scheduled");
        assert!(outcome.follow_ups.is_empty());
    }

    #[test]
    fn test_change_availability_connector_zero() {
        let mut station = Station::new(2);
        let mut registry = ConfigurationRegistry::new(60, 2, 22000);

        let call = call(
            Action::ChangeAvailability,
            serde_json::json!({"connectorId": 0, "type": "Inoperative"}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);
        assert_eq!(result_payload(&outcome)["status"], "Accepted");
        assert_eq!(outcome.follow_ups.len(), 2);
        assert_eq!(
            station.connector(2).unwrap().status,
            ChargePointStatus::Unavailable
        );
    }

    #[test]
    fn test_change_configuration() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(
            Action::ChangeConfiguration,
            serde_json::json!({"key": "HeartbeatInterval", "value": "30"}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);

        assert_eq!(result_payload(&outcome)["status"], "Accepted");
        assert_eq!(registry.get("HeartbeatInterval"), Some("30"));
        assert!(matches!(
            outcome.events.as_slice(),
            [EngineEvent::ConfigurationChanged { .. }]
        ));
    }

    #[test]
    fn test_get_configuration_filtered() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(
            Action::GetConfiguration,
            serde_json::json!({"key": ["HeartbeatInterval", "Bogus"]}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);
        let payload = result_payload(&outcome);

        assert_eq!(payload["configurationKey"][0]["key"], "HeartbeatInterval");
        assert_eq!(payload["unknownKey"][0], "Bogus");
    }

    #[test]
    fn test_get_configuration_empty_key_list_returns_all() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(Action::GetConfiguration, serde_json::json!({"key": []}));
        let outcome = dispatch_call(&call, &mut station, &mut registry);
        let payload = result_payload(&outcome);

        let keys = payload["configurationKey"].as_array().unwrap();
        assert!(!keys.is_empty());
        assert!(payload.get("unknownKey").is_none());
    }

    #[test]
    fn test_unlock_connector_stops_transaction() {
        let mut station = charging_station();
        let mut registry = ConfigurationRegistry::new(60, 2, 22000);

        let call = call(
            Action::UnlockConnector,
            serde_json::json!({"connectorId": 1}),
        );
        let outcome = dispatch_call(&call, &mut station, &mut registry);

        assert_eq!(result_payload(&outcome)["status"], "Unlocked");
        assert!(matches!(
            outcome.follow_ups.as_slice(),
            [FollowUp::StopTransaction {
                connector_id: 1,
                reason: Reason::UnlockCommand,
            }]
        ));
    }

    #[test]
    fn test_trigger_message() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let heartbeat = call(
            Action::TriggerMessage,
            serde_json::json!({"requestedMessage": "Heartbeat"}),
        );
        let outcome = dispatch_call(&heartbeat, &mut station, &mut registry);
        assert_eq!(result_payload(&outcome)["status"], "Accepted");
        assert!(matches!(
            outcome.follow_ups.as_slice(),
            [FollowUp::SendHeartbeat]
        ));

        let firmware = call(
            Action::TriggerMessage,
            serde_json::json!({"requestedMessage": "FirmwareStatusNotification"}),
        );
        let outcome = dispatch_call(&firmware, &mut station, &mut registry);
        assert_eq!(result_payload(&outcome)["status"], "NotImplemented");
    }

    #[test]
    fn test_cp_action_inbound_not_implemented() {
        let mut station = Station::new(1);
        let mut registry = ConfigurationRegistry::new(60, 1, 22000);

        let call = call(Action::Heartbeat, serde_json::json!({}));
        let outcome = dispatch_call(&call, &mut station, &mut registry);
        assert_error(&outcome, ErrorCode::NotImplemented);
    }
}
