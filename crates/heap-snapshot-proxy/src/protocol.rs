//! Wire envelopes exchanged with the snapshot worker.
//!
//! Requests are typed and serialized with serde. Responses are classified by
//! shape, since a single inbound stream carries call results, call failures and
//! unsolicited events.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{ProxyError, Result};

/// Identifier correlating a request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

/// Identifier of an object living in the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request envelope posted to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub call_id: CallId,
    #[serde(flatten)]
    pub body: RequestBody,
}

/// Disposition-specific part of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "disposition",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RequestBody {
    /// Instantiate the worker-side type named by `method_name`.
    Create {
        object_id: ObjectId,
        method_name: String,
    },
    Dispose {
        object_id: ObjectId,
    },
    Method {
        object_id: ObjectId,
        method_name: String,
        method_arguments: Vec<Value>,
    },
    /// Invoke a method and register its result under `new_object_id`.
    Factory {
        object_id: ObjectId,
        method_name: String,
        method_arguments: Vec<Value>,
        new_object_id: ObjectId,
    },
    EvaluateForTest {
        source: String,
    },
}

impl RequestBody {
    pub fn disposition(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Dispose { .. } => "dispose",
            Self::Method { .. } => "method",
            Self::Factory { .. } => "factory",
            Self::EvaluateForTest { .. } => "evaluateForTest",
        }
    }
}

/// Unsolicited message from the worker, not tied to any call.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub name: String,
    pub data: Value,
}

/// Failure reported by the worker for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    pub call_id: CallId,
    pub method_name: Option<String>,
    pub call_stack: Option<String>,
}

/// Inbound message from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
    Event(WorkerEvent),
    Failure(WorkerFailure),
    Success { call_id: CallId, result: Value },
}

impl WorkerResponse {
    /// Classify a raw inbound message by its shape.
    ///
    /// Events are recognised first and need no call id. Anything else must carry
    /// a numeric `callId`; a truthy `error` field marks a failure.
    pub fn classify(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(ProxyError::Protocol(
                "expected JSON object worker message".to_string(),
            ));
        };

        if let Some(event_name) = map.remove("eventName") {
            let name = event_name
                .as_str()
                .ok_or_else(|| ProxyError::Protocol("invalid eventName".to_string()))?
                .to_string();
            let data = map.remove("data").unwrap_or(Value::Null);
            return Ok(Self::Event(WorkerEvent { name, data }));
        }

        let call_id = map
            .get("callId")
            .and_then(Value::as_u64)
            .map(CallId)
            .ok_or_else(|| ProxyError::Protocol("missing or invalid callId".to_string()))?;

        if map.get("error").is_some_and(is_truthy) {
            let method_name = map
                .get("errorMethodName")
                .and_then(Value::as_str)
                .map(str::to_string);
            let call_stack = text_field(&map, "errorCallStack");
            return Ok(Self::Failure(WorkerFailure {
                call_id,
                method_name,
                call_stack,
            }));
        }

        let result = map.remove("result").unwrap_or(Value::Null);
        Ok(Self::Success { call_id, result })
    }

    /// Encode in the shape [`WorkerResponse::classify`] accepts.
    pub fn into_value(self) -> Value {
        match self {
            Self::Event(event) => json!({
                "eventName": event.name,
                "data": event.data,
            }),
            Self::Failure(failure) => json!({
                "callId": failure.call_id,
                "error": true,
                "errorMethodName": failure.method_name,
                "errorCallStack": failure.call_stack,
            }),
            Self::Success { call_id, result } => json!({
                "callId": call_id,
                "result": result,
            }),
        }
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
