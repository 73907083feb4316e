//! The request/response documents exchanged between clients and the broker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The operation a request asks the broker to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ping,
    Status,
    LoadModel,
    Infer,
    UnloadModel,
}

impl Action {
    /// Whether the action touches the device and therefore goes through the worker queue.
    pub fn is_queued(self) -> bool {
        matches!(self, Action::LoadModel | Action::Infer | Action::UnloadModel)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::Status => "status",
            Action::LoadModel => "load_model",
            Action::Infer => "infer",
            Action::UnloadModel => "unload_model",
        }
    }
}

/// One broker call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    /// Correlation token, echoed verbatim in the response.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub request_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub model_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub input_data: Map<String, Value>,
}

impl Request {
    /// Creates a request for `action` with every optional field empty.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            request_id: Value::Null,
            model_path: None,
            model_type: None,
            model_params: Map::new(),
            input_data: Map::new(),
        }
    }

    /// Creates a request addressing the model cached under (`model_path`, `model_type`).
    pub fn for_model(action: Action, model_path: &str, model_type: &str) -> Self {
        Self {
            model_path: Some(model_path.to_string()),
            model_type: Some(model_type.to_string()),
            ..Self::new(action)
        }
    }

    /// Parses a request out of an already decoded JSON document.
    ///
    /// # Returns
    /// The request, or the parse error paired with whatever `request_id` could be
    /// recovered so the error response can still be correlated.
    pub fn from_value(value: Value) -> Result<Self, (Value, serde_json::Error)> {
        let request_id = value.get("request_id").cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| (request_id, e))
    }
}

/// The structured error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Either the action-specific payload or the error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Value),
    Error(ErrorBody),
}

/// One reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub request_id: Value,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn ok(request_id: Value, result: Value) -> Self {
        Self {
            request_id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(request_id: Value, kind: &str, message: impl Into<String>) -> Self {
        Self {
            request_id,
            outcome: Outcome::Error(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    /// Consumes the response into a plain `Result`.
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(body) => Err(body),
        }
    }
}
