use std::sync::Arc;

use tracing::warn;

use crate::{
    config::EngineConfig,
    error::ConfigError,
    model::{CandleBackend, HubSource, InferenceBackend, ModelRegistry, WeightSource},
};

use super::engine::QuestionEngine;

/// Builder for constructing a QuestionEngine instance
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    backend: Option<Arc<dyn InferenceBackend>>,
    source: Option<Arc<dyn WeightSource>>,
    preload: bool,
}

impl EngineBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a specific inference backend; defaults to [`CandleBackend`]
    pub fn with_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a specific weight source; defaults to [`HubSource::from_env`]
    pub fn with_weight_source(mut self, source: Arc<dyn WeightSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Load every configured model before returning
    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    /// Build the engine instance
    pub async fn build(self) -> Result<QuestionEngine, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(CandleBackend::default()),
        };
        let source = match self.source {
            Some(source) => source,
            None => Arc::new(
                HubSource::from_env().map_err(|e| ConfigError::invalid("weight_source", format!("{e:#}")))?,
            ),
        };

        let registry = ModelRegistry::new(config.cache_dir.clone(), source, backend);
        for model in &config.models {
            registry
                .register(model.clone(), false)
                .map_err(|e| ConfigError::invalid("models", e.to_string()))?;
        }

        if self.preload {
            let failed = registry
                .preload_all()
                .await
                .into_iter()
                .filter(|(_, outcome)| outcome.is_err())
                .count();
            if failed > 0 {
                warn!(failed, "some models failed to load on startup");
            }
        }

        Ok(QuestionEngine {
            config: Arc::new(config),
            registry: Arc::new(registry),
        })
    }
}
