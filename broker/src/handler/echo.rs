use comms::tensor::{self, Tensor};
use log::debug;
use serde_json::{Map, Value};

use super::{HandlerError, ModelHandle, ModelHandler};
use crate::device::Device;

/// Returns its input unchanged, after checking every embedded tensor decodes.
///
/// Needs no vendor runtime, which makes it usable for health checks and
/// smoke tests of a deployed broker.
pub struct EchoHandler;

struct EchoModel {
    path: String,
}

impl ModelHandler for EchoHandler {
    fn load(
        &self,
        device: &Device,
        path: &str,
        _params: &Map<String, Value>,
    ) -> Result<ModelHandle, HandlerError> {
        debug!("echo model {path} bound to {}", device.label());
        Ok(Box::new(EchoModel {
            path: path.to_string(),
        }))
    }

    fn infer(
        &self,
        handle: &mut ModelHandle,
        input: &Map<String, Value>,
    ) -> Result<Value, HandlerError> {
        let model = handle
            .downcast_ref::<EchoModel>()
            .ok_or_else(|| HandlerError::HandleLost("not an echo model".into()))?;

        for (name, value) in input.iter().filter(|(_, v)| tensor::is_tensor(v)) {
            let t = Tensor::from_json(value)?;
            debug!(
                "{}: input {name} is a {} tensor of shape {:?}",
                model.path,
                t.dtype(),
                t.shape()
            );
        }

        Ok(Value::Object(input.clone()))
    }

    fn unload(&self, _handle: ModelHandle) -> Result<(), HandlerError> {
        Ok(())
    }
}
