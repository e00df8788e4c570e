//! Configuration-driven model routing.
//!
//! Cursor, when registered and healthy, is the unified primary for every
//! model; the native adapters serve their own prefix families otherwise.

use std::sync::Arc;

use relay_core::{ErrorKind, ProviderSettings, RelayError};
use tracing::info;

use crate::adapter::ProviderAdapter;
use crate::anthropic::AnthropicAdapter;
use crate::free_models::free_model_catalog;
use crate::google::GoogleAdapter;
use crate::openai::OpenAiCompatAdapter;
use crate::types::ModelInfo;

/// Routes a model id to the adapter that will serve it.
pub struct ProviderRouter {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    cursor: Option<Arc<dyn ProviderAdapter>>,
}

impl ProviderRouter {
    /// Registers one adapter per configured provider plus an optional
    /// injected Cursor adapter.
    pub fn from_settings(
        settings: &ProviderSettings,
        cursor: Option<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();
        if let Some(adapter) = OpenAiCompatAdapter::openai(&settings.openai) {
            adapters.push(Arc::new(adapter));
        }
        if let Some(adapter) = AnthropicAdapter::from_endpoint(&settings.anthropic) {
            adapters.push(Arc::new(adapter));
        }
        if let Some(adapter) = GoogleAdapter::from_endpoint(&settings.google) {
            adapters.push(Arc::new(adapter));
        }
        if let Some(adapter) = OpenAiCompatAdapter::deepseek(&settings.deepseek) {
            adapters.push(Arc::new(adapter));
        }
        if let Some(adapter) = OpenAiCompatAdapter::openrouter(&settings.openrouter) {
            adapters.push(Arc::new(adapter));
        }

        let names: Vec<&str> = adapters.iter().map(|adapter| adapter.name()).collect();
        info!(providers = ?names, cursor = cursor.is_some(), "provider router initialised");

        Self { adapters, cursor }
    }

    /// Builds a router from pre-constructed adapters; used by tests and by
    /// callers with bespoke wiring.
    pub fn from_adapters(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        cursor: Option<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        Self { adapters, cursor }
    }

    fn adapter_named(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.name() == name)
            .cloned()
    }

    /// Picks the serving adapter for `model`.
    ///
    /// Deterministic for a fixed router state: the same model maps to the
    /// same provider on every call.
    pub fn select(&self, model: &str) -> Result<Arc<dyn ProviderAdapter>, RelayError> {
        if let Some(cursor) = &self.cursor {
            if cursor.is_available() {
                return Ok(Arc::clone(cursor));
            }
        }

        let provider = relay_pricing::infer_provider(model).ok_or_else(|| {
            RelayError::new(
                ErrorKind::ProviderNotAvailable,
                format!("no provider route for model '{model}'"),
            )
            .with_model(model)
        })?;

        self.adapter_named(provider).ok_or_else(|| {
            RelayError::new(
                ErrorKind::ProviderNotAvailable,
                format!("provider '{provider}' is not configured"),
            )
            .with_provider(provider)
            .with_model(model)
        })
    }

    /// Union of every registered adapter's models plus the free catalogue.
    pub fn all_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();
        if let Some(cursor) = &self.cursor {
            models.extend(cursor.supported_models());
        }
        for adapter in &self.adapters {
            models.extend(adapter.supported_models());
        }
        for free in free_model_catalog() {
            if !models.iter().any(|row| row.id == free.id && row.free) {
                models.push(free);
            }
        }
        models
    }

    /// Names of every registered provider, Cursor first when present.
    pub fn provider_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if let Some(cursor) = &self.cursor {
            names.push(cursor.name());
        }
        names.extend(self.adapters.iter().map(|adapter| adapter.name()));
        names
    }
}
