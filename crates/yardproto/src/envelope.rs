//! Request, response, and notification envelopes.
//!
//! Envelopes are JSON objects. Requests carry a transaction id, the target
//! method/service, an authority tag, optional structured params, a
//! wall-clock timestamp in milliseconds, and the caller's timeout.
//! Responses echo the transaction id and carry success/result/error fields.
//! Notifications look like requests without correlation - fire and forget.
//!
//! Decoding is field-by-field rather than a straight serde derive so that
//! failures surface as a typed [`DecodeError`] naming what went wrong
//! (missing transaction id, unknown authority, malformed JSON) instead of a
//! generic parse error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::txid;

/// Authority class carried in every envelope.
///
/// This is a categorical attribute only: the client serialises it
/// faithfully and never enforces policy. Servers may reject based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    Admin,
    User,
    Guest,
    System,
}

impl Authority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authority::Admin => "admin",
            Authority::User => "user",
            Authority::Guest => "guest",
            Authority::System => "system",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Authority::Admin),
            "user" => Some(Authority::User),
            "guest" => Some(Authority::Guest),
            "system" => Some(Authority::System),
            _ => None,
        }
    }
}

/// What went wrong while decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeErrorKind {
    /// The bytes were not a JSON object at all.
    #[error("malformed envelope")]
    Malformed,
    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// A field is present but has the wrong JSON type.
    #[error("wrong type for field: {0}")]
    WrongType(&'static str),
    /// The authority string is not one of admin/user/guest/system.
    #[error("unknown authority: {0}")]
    UnknownAuthority(String),
    /// The transaction id is empty or not from the minter's alphabet.
    #[error("invalid transaction id")]
    InvalidTransactionId,
    /// A structural invariant does not hold (e.g. a failed response with
    /// error_code 0).
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

/// Typed decode failure with an optional byte offset into the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub offset: Option<usize>,
}

impl DecodeError {
    fn new(kind: DecodeErrorKind) -> Self {
        Self { kind, offset: None }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "envelope decode failed: {}", self.kind)?;
        if let Some(offset) = self.offset {
            write!(f, " at byte {offset}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DecodeError {}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub transaction_id: String,
    pub method: String,
    pub service: String,
    pub authority: Authority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub timeout_ms: u64,
}

impl RpcRequest {
    /// Build a request with a freshly minted transaction id and the current
    /// wall-clock timestamp.
    pub fn new(
        method: impl Into<String>,
        service: impl Into<String>,
        authority: Authority,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            transaction_id: txid::mint_transaction_id(),
            method: method.into(),
            service: service.into(),
            authority,
            params,
            timestamp: chrono::Utc::now().timestamp_millis(),
            timeout_ms,
        }
    }

    /// Serialise to JSON bytes, checking invariants first.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        if self.transaction_id.is_empty() {
            return Err(DecodeError::new(DecodeErrorKind::InvalidTransactionId));
        }
        serde_json::to_vec(self).map_err(|_| DecodeError::new(DecodeErrorKind::Malformed))
    }

    /// Parse and validate a request envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let obj = parse_object(bytes)?;
        let transaction_id = require_transaction_id(&obj)?;
        let request = Self {
            transaction_id,
            method: require_str(&obj, "method")?,
            service: require_str(&obj, "service")?,
            authority: require_authority(&obj)?,
            params: obj.get("params").filter(|v| !v.is_null()).cloned(),
            timestamp: require_i64(&obj, "timestamp")?,
            timeout_ms: require_u64(&obj, "timeout_ms")?,
        };
        Ok(request)
    }
}

/// Response envelope. Echoes the request's transaction id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub transaction_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub error_code: i64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub processing_time_ms: u64,
}

impl RpcResponse {
    /// Successful response carrying `result`.
    pub fn success(
        transaction_id: impl Into<String>,
        result: Option<Value>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            success: true,
            result,
            error_message: None,
            error_code: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
            processing_time_ms,
        }
    }

    /// Failed response. `error_code` must be non-zero.
    pub fn failure(
        transaction_id: impl Into<String>,
        error_code: i64,
        error_message: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            success: false,
            result: None,
            error_message: Some(error_message.into()),
            error_code,
            timestamp: chrono::Utc::now().timestamp_millis(),
            processing_time_ms,
        }
    }

    /// Serialise to JSON bytes, checking invariants first.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        self.check_invariants()?;
        serde_json::to_vec(self).map_err(|_| DecodeError::new(DecodeErrorKind::Malformed))
    }

    /// Parse and validate a response envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let obj = parse_object(bytes)?;
        let response = Self {
            transaction_id: require_transaction_id(&obj)?,
            success: require_bool(&obj, "success")?,
            result: obj.get("result").filter(|v| !v.is_null()).cloned(),
            error_message: match obj.get("error_message") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => {
                    return Err(DecodeError::new(DecodeErrorKind::WrongType("error_message")))
                }
            },
            error_code: require_i64(&obj, "error_code")?,
            timestamp: require_i64(&obj, "timestamp")?,
            processing_time_ms: require_u64(&obj, "processing_time_ms")?,
        };
        response.check_invariants()?;
        Ok(response)
    }

    fn check_invariants(&self) -> Result<(), DecodeError> {
        if self.transaction_id.is_empty() {
            return Err(DecodeError::new(DecodeErrorKind::InvalidTransactionId));
        }
        if self.success && (self.error_message.is_some() || self.error_code != 0) {
            return Err(DecodeError::new(DecodeErrorKind::Invariant(
                "successful response carries error fields",
            )));
        }
        if !self.success && self.error_code == 0 {
            return Err(DecodeError::new(DecodeErrorKind::Invariant(
                "failed response has error_code 0",
            )));
        }
        Ok(())
    }
}

/// Notification envelope - a request shape without correlation or timeout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub method: String,
    pub service: String,
    pub authority: Authority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Notification {
    pub fn new(
        method: impl Into<String>,
        service: impl Into<String>,
        authority: Authority,
        params: Option<Value>,
    ) -> Self {
        Self {
            method: method.into(),
            service: service.into(),
            authority,
            params,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(self).map_err(|_| DecodeError::new(DecodeErrorKind::Malformed))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let obj = parse_object(bytes)?;
        Ok(Self {
            method: require_str(&obj, "method")?,
            service: require_str(&obj, "service")?,
            authority: require_authority(&obj)?,
            params: obj.get("params").filter(|v| !v.is_null()).cloned(),
            timestamp: require_i64(&obj, "timestamp")?,
        })
    }
}

// === field extraction helpers ===

fn parse_object(bytes: &[u8]) -> Result<serde_json::Map<String, Value>, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| DecodeError {
        kind: DecodeErrorKind::Malformed,
        // serde_json reports 1-based columns; single-line JSON makes this a
        // usable byte offset.
        offset: Some(e.column().saturating_sub(1)),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::new(DecodeErrorKind::Malformed)),
    }
}

fn require_transaction_id(obj: &serde_json::Map<String, Value>) -> Result<String, DecodeError> {
    let id = require_str(obj, "transaction_id")?;
    if id.is_empty() {
        return Err(DecodeError::new(DecodeErrorKind::InvalidTransactionId));
    }
    Ok(id)
}

fn require_authority(obj: &serde_json::Map<String, Value>) -> Result<Authority, DecodeError> {
    let raw = require_str(obj, "authority")?;
    Authority::from_str(&raw)
        .ok_or_else(|| DecodeError::new(DecodeErrorKind::UnknownAuthority(raw)))
}

fn require_str(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match obj.get(field) {
        None => Err(DecodeError::new(DecodeErrorKind::MissingField(field))),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DecodeError::new(DecodeErrorKind::WrongType(field))),
    }
}

fn require_bool(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<bool, DecodeError> {
    match obj.get(field) {
        None => Err(DecodeError::new(DecodeErrorKind::MissingField(field))),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(DecodeError::new(DecodeErrorKind::WrongType(field))),
    }
}

fn require_i64(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<i64, DecodeError> {
    match obj.get(field) {
        None => Err(DecodeError::new(DecodeErrorKind::MissingField(field))),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| DecodeError::new(DecodeErrorKind::WrongType(field))),
    }
}

fn require_u64(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<u64, DecodeError> {
    match obj.get(field) {
        None => Err(DecodeError::new(DecodeErrorKind::MissingField(field))),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| DecodeError::new(DecodeErrorKind::WrongType(field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_roundtrip() {
        let request = RpcRequest::new(
            "ping",
            "svc",
            Authority::User,
            Some(serde_json::json!({"x": 42})),
            5000,
        );
        let bytes = request.encode().unwrap();
        let parsed = RpcRequest::decode(&bytes).unwrap();
        assert_eq!(request, parsed);
    }

    #[test]
    fn request_without_params_roundtrip() {
        let request = RpcRequest::new("status", "gateway", Authority::System, None, 1000);
        let bytes = request.encode().unwrap();
        // params must be absent on the wire, not null.
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(raw.get("params").is_none());
        let parsed = RpcRequest::decode(&bytes).unwrap();
        assert_eq!(request, parsed);
    }

    #[test]
    fn response_roundtrip() {
        let response = RpcResponse::success(
            mint_id(),
            Some(serde_json::json!({"echo": "ping"})),
            12,
        );
        let bytes = response.encode().unwrap();
        let parsed = RpcResponse::decode(&bytes).unwrap();
        assert_eq!(response, parsed);
    }

    #[test]
    fn failure_response_roundtrip() {
        let response = RpcResponse::failure(mint_id(), 503, "service unavailable", 3);
        let bytes = response.encode().unwrap();
        let parsed = RpcResponse::decode(&bytes).unwrap();
        assert_eq!(parsed.error_code, 503);
        assert_eq!(parsed.error_message.as_deref(), Some("service unavailable"));
        assert!(!parsed.success);
    }

    #[test]
    fn notification_roundtrip() {
        let notification = Notification::new(
            "sensor_update",
            "metrics",
            Authority::Guest,
            Some(serde_json::json!({"temp": 21.5})),
        );
        let bytes = notification.encode().unwrap();
        let parsed = Notification::decode(&bytes).unwrap();
        assert_eq!(notification, parsed);
    }

    #[test]
    fn missing_transaction_id_rejected() {
        let bytes = br#"{"method":"ping","service":"svc","authority":"user","timestamp":1,"timeout_ms":5}"#;
        let err = RpcRequest::decode(bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::MissingField("transaction_id"));
    }

    #[test]
    fn empty_transaction_id_rejected() {
        let bytes = br#"{"transaction_id":"","method":"ping","service":"svc","authority":"user","timestamp":1,"timeout_ms":5}"#;
        let err = RpcRequest::decode(bytes).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::InvalidTransactionId);
    }

    #[test]
    fn unknown_authority_rejected() {
        let bytes = br#"{"transaction_id":"1","method":"ping","service":"svc","authority":"root","timestamp":1,"timeout_ms":5}"#;
        let err = RpcRequest::decode(bytes).unwrap_err();
        assert_eq!(
            err.kind,
            DecodeErrorKind::UnknownAuthority("root".to_string())
        );
    }

    #[test]
    fn malformed_input_reports_offset() {
        let err = RpcRequest::decode(b"{not json").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Malformed);
        assert!(err.offset.is_some());
    }

    #[test]
    fn non_object_rejected() {
        let err = RpcRequest::decode(b"[1,2,3]").unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::Malformed);
    }

    #[test]
    fn successful_response_with_error_fields_rejected() {
        let bytes = br#"{"transaction_id":"1","success":true,"error_message":"boom","error_code":1,"timestamp":1,"processing_time_ms":0}"#;
        let err = RpcResponse::decode(bytes).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::Invariant(_)));
    }

    #[test]
    fn failed_response_with_zero_code_rejected() {
        let bytes = br#"{"transaction_id":"1","success":false,"error_message":"boom","error_code":0,"timestamp":1,"processing_time_ms":0}"#;
        let err = RpcResponse::decode(bytes).unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::Invariant(_)));
    }

    #[test]
    fn authority_wire_strings() {
        for (authority, s) in [
            (Authority::Admin, "admin"),
            (Authority::User, "user"),
            (Authority::Guest, "guest"),
            (Authority::System, "system"),
        ] {
            assert_eq!(authority.as_str(), s);
            assert_eq!(Authority::from_str(s), Some(authority));
        }
    }

    fn mint_id() -> String {
        crate::txid::mint_transaction_id()
    }
}
