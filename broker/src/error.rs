use std::{error::Error, fmt, time::Duration};

use comms::{msg::Response, tensor::TensorError};
use serde_json::Value;

/// The broker's result type.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Per-request failures, each one reported to the caller as a structured error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Malformed frame, JSON document, request or tensor.
    Protocol(String),
    UnsupportedModelType(String),
    LoadFailure(String),
    InferenceFailure(String),
    /// The device could not be acquired. Sticky until the process restarts.
    DeviceUnavailable(String),
    /// The job waited longer than the configured maximum queue wait.
    QueueTimeout {
        waited: Duration,
        limit: Duration,
    },
    /// The worker is gone, no more model work is accepted.
    ShuttingDown,
}

impl BrokerError {
    /// The error kind as sent on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Protocol(_) => "ProtocolError",
            BrokerError::UnsupportedModelType(_) => "UnsupportedModelType",
            BrokerError::LoadFailure(_) => "LoadFailure",
            BrokerError::InferenceFailure(_) => "InferenceFailure",
            BrokerError::DeviceUnavailable(_) => "DeviceUnavailable",
            BrokerError::QueueTimeout { .. } => "QueueTimeout",
            BrokerError::ShuttingDown => "ShuttingDown",
        }
    }

    /// Builds the error response correlated to `request_id`.
    pub fn into_response(self, request_id: Value) -> Response {
        Response::error(request_id, self.kind(), self.to_string())
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Protocol(msg) => write!(f, "{msg}"),
            BrokerError::UnsupportedModelType(model_type) => {
                write!(f, "no handler registered for model type {model_type:?}")
            }
            BrokerError::LoadFailure(msg) => write!(f, "failed to load model: {msg}"),
            BrokerError::InferenceFailure(msg) => write!(f, "inference failed: {msg}"),
            BrokerError::DeviceUnavailable(msg) => write!(f, "device unavailable: {msg}"),
            BrokerError::QueueTimeout { waited, limit } => write!(
                f,
                "request waited {} ms in the queue, limit is {} ms",
                waited.as_millis(),
                limit.as_millis()
            ),
            BrokerError::ShuttingDown => write!(f, "broker is shutting down"),
        }
    }
}

impl Error for BrokerError {}

impl From<TensorError> for BrokerError {
    fn from(value: TensorError) -> Self {
        Self::Protocol(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(BrokerError::Protocol(String::new()).kind(), "ProtocolError");
        assert_eq!(
            BrokerError::UnsupportedModelType(String::new()).kind(),
            "UnsupportedModelType"
        );
        assert_eq!(BrokerError::LoadFailure(String::new()).kind(), "LoadFailure");
        assert_eq!(
            BrokerError::InferenceFailure(String::new()).kind(),
            "InferenceFailure"
        );
        assert_eq!(
            BrokerError::DeviceUnavailable(String::new()).kind(),
            "DeviceUnavailable"
        );
    }

    #[test]
    fn response_carries_kind_and_message() {
        let res = BrokerError::UnsupportedModelType("yolo".into()).into_response(json!("r9"));
        let value = serde_json::to_value(res).unwrap();

        assert_eq!(value["request_id"], json!("r9"));
        assert_eq!(value["error"]["kind"], json!("UnsupportedModelType"));
        assert_eq!(
            value["error"]["message"],
            json!("no handler registered for model type \"yolo\"")
        );
    }
}
