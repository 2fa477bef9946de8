//! Provider router: selects a stream adapter by configured provider name.
//!
//! Each configured provider is mapped to its wire family
//! ([`ProviderKind::from_name`]) and built once; callers look adapters up by
//! name or fall back to the default provider.

use std::collections::HashMap;
use std::sync::Arc;

use quill_config::AppConfig;
use quill_core::provider::{ProviderKind, StreamAdapter};
use tracing::debug;

use crate::adapter::StreamLimits;
use crate::anthropic::AnthropicAdapter;
use crate::gemini::GeminiAdapter;
use crate::ollama::OllamaAdapter;
use crate::openai_compat::OpenAiCompatAdapter;

/// Routes provider names to stream adapters.
pub struct ProviderRouter {
    adapters: HashMap<String, Arc<dyn StreamAdapter>>,
    default_provider: String,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            adapters: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register an adapter under a provider name.
    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn StreamAdapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Get the default adapter.
    pub fn default_adapter(&self) -> Option<Arc<dyn StreamAdapter>> {
        self.get(&self.default_provider)
    }

    /// Get a specific adapter by provider name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StreamAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// First registered adapter of a wire family.
    pub fn by_kind(&self, kind: ProviderKind) -> Option<Arc<dyn StreamAdapter>> {
        if let Some(default) = self.default_adapter().filter(|a| a.kind() == kind) {
            return Some(default);
        }
        let mut names: Vec<&String> = self.adapters.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| self.adapters.get(n))
            .find(|a| a.kind() == kind)
            .cloned()
    }

    /// List all registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Build one adapter for a named provider.
pub fn build_adapter(
    name: &str,
    api_key: &str,
    api_url: Option<&str>,
    limits: StreamLimits,
) -> Arc<dyn StreamAdapter> {
    match ProviderKind::from_name(name) {
        ProviderKind::Ollama => Arc::new(OllamaAdapter::new(api_url, limits)),
        ProviderKind::Gemini => {
            let adapter = GeminiAdapter::new(api_key, limits);
            Arc::new(match api_url {
                Some(url) => adapter.with_base_url(url),
                None => adapter,
            })
        }
        ProviderKind::Anthropic => {
            let adapter = AnthropicAdapter::new(api_key, limits);
            Arc::new(match api_url {
                Some(url) => adapter.with_base_url(url),
                None => adapter,
            })
        }
        ProviderKind::OpenAiCompat => {
            let base_url = api_url.map_or_else(|| default_base_url(name), str::to_string);
            Arc::new(OpenAiCompatAdapter::new(name, base_url, api_key, limits))
        }
    }
}

/// Build adapters from configuration.
pub fn build_from_config(config: &AppConfig) -> ProviderRouter {
    let limits = StreamLimits::from_config(&config.stream);
    let mut router = ProviderRouter::new(&config.default_provider);

    for (name, provider_config) in &config.providers {
        let api_key = config.api_key_for(name).unwrap_or_default();
        let adapter = build_adapter(
            name,
            &api_key,
            provider_config.api_url.as_deref(),
            limits.clone(),
        );
        debug!(provider = %name, kind = %adapter.kind(), "Registered provider");
        router.register(name.clone(), adapter);
    }

    // Ensure the default provider exists (even if not explicitly configured)
    if router.get(&config.default_provider).is_none() {
        let api_key = config.api_key_for(&config.default_provider).unwrap_or_default();
        let adapter = build_adapter(&config.default_provider, &api_key, None, limits);
        router.register(config.default_provider.clone(), adapter);
    }

    router
}

/// Get the default base URL for well-known OpenAI-compatible providers.
pub fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "mistral" => "https://api.mistral.ai/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        "lmstudio" => "http://localhost:1234/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_config::ProviderConfig;

    #[test]
    fn router_register_and_lookup() {
        let mut router = ProviderRouter::new("openrouter");
        router.register(
            "openrouter",
            Arc::new(OpenAiCompatAdapter::openrouter("sk-test", StreamLimits::default())),
        );

        assert!(router.get("openrouter").is_some());
        assert!(router.get("nonexistent").is_none());
        assert!(router.default_adapter().is_some());
    }

    #[test]
    fn build_adapter_selects_family() {
        let limits = StreamLimits::default();
        assert_eq!(build_adapter("ollama", "", None, limits.clone()).kind(), ProviderKind::Ollama);
        assert_eq!(build_adapter("gemini", "k", None, limits.clone()).kind(), ProviderKind::Gemini);
        assert_eq!(
            build_adapter("anthropic", "k", None, limits.clone()).kind(),
            ProviderKind::Anthropic
        );
        let groq = build_adapter("groq", "k", None, limits);
        assert_eq!(groq.kind(), ProviderKind::OpenAiCompat);
        assert_eq!(groq.name(), "groq");
    }

    #[test]
    fn build_from_config_always_has_default() {
        let config = AppConfig::default();
        let router = build_from_config(&config);
        let default = router.default_adapter().unwrap();
        assert_eq!(default.kind(), ProviderKind::from_name(&config.default_provider));
    }

    #[test]
    fn build_from_config_registers_configured_providers() {
        let mut config = AppConfig {
            default_provider: "openai".into(),
            ..AppConfig::default()
        };
        config.providers.insert(
            "gemini".into(),
            ProviderConfig {
                api_key: Some("g-key".into()),
                api_url: None,
                default_model: None,
            },
        );
        let router = build_from_config(&config);
        assert_eq!(router.list(), vec!["gemini", "openai"]);
        assert!(router.by_kind(ProviderKind::Gemini).is_some());
        assert!(router.by_kind(ProviderKind::Anthropic).is_none());
        assert_eq!(
            router.by_kind(ProviderKind::OpenAiCompat).unwrap().name(),
            "openai"
        );
    }

    #[test]
    fn known_base_urls() {
        assert!(default_base_url("groq").contains("groq.com"));
        assert!(default_base_url("custom").contains("custom"));
    }
}
