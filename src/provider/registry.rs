//! Registry of language-model providers keyed by short dispatch name.
//!
//! Populated once at gateway construction and read-only thereafter: no
//! dynamic (de)registration happens after `with_defaults()`/`new()` builds
//! the map.

use super::language_model::LanguageModelProvider;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LanguageModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    /// Registers the two adapter shapes this crate ships under their
    /// generic dispatch names.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(super::adapter::UnifiedChatProvider::new())
            .register(super::adapter::CumulativeTextProvider::new())
    }

    pub fn register<P: LanguageModelProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.insert(provider.name().to_string(), Arc::new(provider));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LanguageModelProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_register_both_adapters() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.get("unified").is_some());
        assert!(registry.get("cumulative").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let registry = ProviderRegistry::new();
        assert!(registry.provider_names().is_empty());
    }
}
