use thiserror::Error;

use super::registry::{ModelRegistry, ModelSpec, VISION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no registered model accepts {0} input")]
    NoCapableModel(String),
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Keeps the requested model when it supports `capability`, otherwise
    /// takes the registry's first capable model and says why.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, SelectionError> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());
        if let Some(name) = requested {
            if let Some(model) = self.registry.ensure(name, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(name.to_string()),
                    fallback_reason: None,
                });
            }
        }

        let model = self
            .registry
            .by_capability(capability)
            .into_iter()
            .next()
            .ok_or_else(|| SelectionError::NoCapableModel(capability.to_string()))?;
        let fallback_reason = match requested {
            Some(name) if self.registry.get(name).is_some() => {
                format!("Model '{name}' does not accept {capability} input; using {}.", model.name)
            }
            Some(name) => format!("Unknown model '{name}'; using {}.", model.name),
            None => format!("No model specified; using {}.", model.name),
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }

    pub fn vision(&self, requested: Option<&str>) -> Result<ModelSelection, SelectionError> {
        self.select(requested, VISION)
    }
}
