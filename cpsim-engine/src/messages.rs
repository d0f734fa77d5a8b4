//! OCPP 1.6 JSON message framing
//!
//! OCPP 1.6-J frames messages as JSON arrays over WebSocket:
//! - CALL: [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR: [4, uniqueId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::*;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

/// OCPP action names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    StatusNotification,
    MeterValues,
    StartTransaction,
    StopTransaction,

    // CSMS -> CP
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
    ChangeAvailability,
    ChangeConfiguration,
    GetConfiguration,
    UnlockConnector,
    TriggerMessage,
    ClearCache,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "MeterValues" => Ok(Action::MeterValues),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StopTransaction" => Ok(Action::StopTransaction),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "Reset" => Ok(Action::Reset),
            "ChangeAvailability" => Ok(Action::ChangeAvailability),
            "ChangeConfiguration" => Ok(Action::ChangeConfiguration),
            "GetConfiguration" => Ok(Action::GetConfiguration),
            "UnlockConnector" => Ok(Action::UnlockConnector),
            "TriggerMessage" => Ok(Action::TriggerMessage),
            "ClearCache" => Ok(Action::ClearCache),
            _ => Err(s.to_string()),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    /// The frame was a well-formed CALL but named an action this charge
    /// point does not implement. Carries the uniqueId so the receiver can
    /// answer with a NotImplemented CALLERROR.
    #[error("Unknown action: {action}")]
    UnknownAction { message_id: String, action: String },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("OCPP error from CSMS: {code:?} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub unique_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated uniqueId
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            unique_id: Uuid::new_v4().to_string(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create BootNotification call
    pub fn boot_notification(req: BootNotificationRequest) -> Result<Self, OcppError> {
        Self::new(Action::BootNotification, req)
    }

    /// Create Heartbeat call
    pub fn heartbeat() -> Result<Self, OcppError> {
        Self::new(Action::Heartbeat, HeartbeatRequest {})
    }

    /// Create StatusNotification call
    pub fn status_notification(
        connector_id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
    ) -> Result<Self, OcppError> {
        Self::new(
            Action::StatusNotification,
            StatusNotificationRequest {
                connector_id,
                error_code,
                status,
                timestamp: Some(chrono::Utc::now()),
                info: None,
            },
        )
    }

    /// Create MeterValues call
    pub fn meter_values(
        connector_id: u32,
        transaction_id: Option<i64>,
        meter_value: Vec<MeterValue>,
    ) -> Result<Self, OcppError> {
        Self::new(
            Action::MeterValues,
            MeterValuesRequest {
                connector_id,
                transaction_id,
                meter_value,
            },
        )
    }

    /// Create StartTransaction call
    pub fn start_transaction(req: StartTransactionRequest) -> Result<Self, OcppError> {
        Self::new(Action::StartTransaction, req)
    }

    /// Create StopTransaction call
    pub fn stop_transaction(req: StopTransactionRequest) -> Result<Self, OcppError> {
        Self::new(Action::StopTransaction, req)
    }

    /// Serialize to OCPP wire format: [2, uniqueId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.unique_id,
            self.action.to_string(),
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(unique_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            unique_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, uniqueId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.unique_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub unique_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        unique_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            unique_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, uniqueId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.unique_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        if array.is_empty() {
            return Err(OcppError::InvalidFormat);
        }

        let msg_type = array[0].as_i64().ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                // CALL: [2, uniqueId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let unique_id = array[1]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                let action_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;

                let action: Action =
                    action_str
                        .parse()
                        .map_err(|action| OcppError::UnknownAction {
                            message_id: unique_id.clone(),
                            action,
                        })?;
                let payload = array[3].clone();

                Ok(OcppMessage::Call(Call {
                    unique_id,
                    action,
                    payload,
                }))
            }
            3 => {
                // CALLRESULT: [3, uniqueId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                let unique_id = array[1]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                let payload = array[2].clone();

                Ok(OcppMessage::CallResult(CallResult { unique_id, payload }))
            }
            4 => {
                // CALLERROR: [4, uniqueId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let unique_id = array[1]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;

                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                let error_details = array[4].clone();

                Ok(OcppMessage::CallError(CallError {
                    unique_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the uniqueId
    pub fn unique_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.unique_id,
            OcppMessage::CallResult(r) => &r.unique_id,
            OcppMessage::CallError(e) => &e.unique_id,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let call = Call::heartbeat().unwrap();
        let bytes = call.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_survives_serialize_parse() {
        let call = Call::start_transaction(StartTransactionRequest {
            connector_id: 2,
            id_tag: "TAG123".to_string(),
            meter_start: 1500,
            timestamp: chrono::Utc::now(),
        })
        .unwrap();

        let bytes = call.to_bytes().unwrap();
        match OcppMessage::parse(&bytes).unwrap() {
            OcppMessage::Call(parsed) => {
                assert_eq!(parsed.unique_id, call.unique_id);
                assert_eq!(parsed.action, call.action);
                assert_eq!(parsed.payload, call.payload);
            }
            other => panic!("Expected Call, got {other:?}"),
        }
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.unique_id, "msg-123");
                assert_eq!(call.action, Action::Heartbeat);
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.unique_id, "msg-123");
                let resp: HeartbeatResponse = result.parse_payload().unwrap();
                assert_eq!(resp.current_time.timestamp(), 1768910400);
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.unique_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_unknown_action_keeps_unique_id() {
        let json = r#"[2, "msg-789", "DataTransfer", {}]"#;
        let err = OcppMessage::parse(json.as_bytes()).unwrap_err();

        match err {
            OcppError::UnknownAction { message_id, action } => {
                assert_eq!(message_id, "msg-789");
                assert_eq!(action, "DataTransfer");
            }
            other => panic!("Expected UnknownAction, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_start_request() {
        let json = r#"[2, "uuid-456", "RemoteStartTransaction", {
            "idTag": "TAG42",
            "connectorId": 1
        }]"#;

        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.action, Action::RemoteStartTransaction);
                let req: RemoteStartTransactionRequest =
                    serde_json::from_value(call.payload).unwrap();
                assert_eq!(req.id_tag, "TAG42");
                assert_eq!(req.connector_id, Some(1));
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(matches!(
            OcppMessage::parse(b"[2, \"id-1\", \"Heartbeat\"]"),
            Err(OcppError::InvalidFormat)
        ));
        assert!(matches!(
            OcppMessage::parse(b"[7, \"id-1\", {}]"),
            Err(OcppError::UnknownMessageType(7))
        ));
        assert!(matches!(
            OcppMessage::parse(b"not json"),
            Err(OcppError::JsonError(_))
        ));
    }
}
