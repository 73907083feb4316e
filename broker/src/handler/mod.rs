//! The seam where model families plug into the broker.
//!
//! A `ModelHandler` translates the generic load/infer/unload calls into calls
//! against the vendor runtime of one model family. Handlers only ever run on the
//! worker thread, one call at a time.

mod echo;
mod registry;

use std::{any::Any, error::Error, fmt};

use comms::tensor::TensorError;
use serde_json::{Map, Value};

use crate::device::Device;

pub use echo::EchoHandler;
pub use registry::{HandlerRegistry, RegistryBuilder};

/// The runtime state of one loaded model, opaque to the broker.
pub type ModelHandle = Box<dyn Any + Send>;

/// Strategy for one model family.
pub trait ModelHandler: Send + Sync {
    /// Loads the artifact at `path` onto `device`.
    ///
    /// # Errors
    /// Reported to the caller as `LoadFailure`, nothing is cached.
    fn load(
        &self,
        device: &Device,
        path: &str,
        params: &Map<String, Value>,
    ) -> Result<ModelHandle, HandlerError>;

    /// Runs one inference against a loaded model.
    ///
    /// # Errors
    /// Reported as `InferenceFailure`. The cache entry survives unless the
    /// error is `HandlerError::HandleLost`.
    fn infer(
        &self,
        handle: &mut ModelHandle,
        input: &Map<String, Value>,
    ) -> Result<Value, HandlerError>;

    /// Frees the runtime resources behind `handle`. Best-effort.
    fn unload(&self, handle: ModelHandle) -> Result<(), HandlerError>;
}

/// Failures raised by handlers.
#[derive(Debug)]
pub enum HandlerError {
    Failed(String),
    /// An embedded tensor could not be decoded.
    Tensor(TensorError),
    /// The handle is no longer usable and must be dropped from the cache.
    HandleLost(String),
    /// The handler panicked. Its handle is treated as lost.
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Failed(msg) => write!(f, "{msg}"),
            HandlerError::Tensor(e) => write!(f, "{e}"),
            HandlerError::HandleLost(msg) => write!(f, "model handle lost: {msg}"),
            HandlerError::Panicked(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HandlerError::Tensor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TensorError> for HandlerError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}
