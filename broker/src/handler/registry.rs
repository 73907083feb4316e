use std::{collections::HashMap, sync::Arc};

use crate::error::{BrokerError, Result};

use super::ModelHandler;

/// Collects handlers before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Arc<dyn ModelHandler>>,
}

impl RegistryBuilder {
    /// Registers `handler` under `model_type`, replacing any earlier registration.
    ///
    /// # Arguments
    /// * `model_type` - The tag clients put in `model_type`.
    /// * `handler` - The strategy serving that tag.
    pub fn register(
        mut self,
        model_type: impl Into<String>,
        handler: impl ModelHandler + 'static,
    ) -> Self {
        self.handlers.insert(model_type.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable lookup from model type to handler.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ModelHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Finds the handler for `model_type`.
    ///
    /// # Errors
    /// `UnsupportedModelType` if nothing was registered under that tag.
    pub fn resolve(&self, model_type: &str) -> Result<Arc<dyn ModelHandler>> {
        self.handlers
            .get(model_type)
            .cloned()
            .ok_or_else(|| BrokerError::UnsupportedModelType(model_type.to_string()))
    }

    /// Registered tags, sorted.
    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EchoHandler;

    #[test]
    fn resolves_registered_types_only() {
        let registry = HandlerRegistry::builder()
            .register("echo", EchoHandler)
            .register("alias", EchoHandler)
            .build();

        assert!(registry.resolve("echo").is_ok());
        assert_eq!(registry.model_types(), vec!["alias", "echo"]);
        assert_eq!(
            registry.resolve("whisper").err(),
            Some(BrokerError::UnsupportedModelType("whisper".into()))
        );
    }
}
