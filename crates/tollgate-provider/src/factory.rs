use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tollgate_core::config::{LlmConfig, ProvidersConfig};
use tracing::info;

use crate::anthropic::AnthropicProvider;
use crate::gigachat::GigaChatProvider;
use crate::openai::OpenAiProvider;
use crate::provider::Provider;

/// Build one adapter per configured provider, keyed by the tag the model
/// catalog uses. A model whose provider has no credentials configured fails
/// at request time with a clear error rather than at startup.
pub fn build_providers(
    providers: &ProvidersConfig,
    llm: &LlmConfig,
) -> HashMap<String, Arc<dyn Provider>> {
    let mut map: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    let timeout = Duration::from_secs(llm.timeout_seconds);

    if let Some(ref openai) = providers.openai {
        map.insert(
            "openai".to_string(),
            Arc::new(OpenAiProvider::new(
                openai.api_key.clone(),
                openai.base_url.clone(),
                timeout,
            )),
        );
    }

    if let Some(ref anthropic) = providers.anthropic {
        map.insert(
            "anthropic".to_string(),
            Arc::new(AnthropicProvider::new(
                anthropic.api_key.clone(),
                anthropic.base_url.clone(),
                timeout,
            )),
        );
    }

    if let Some(ref gigachat) = providers.gigachat {
        map.insert(
            "gigachat".to_string(),
            Arc::new(GigaChatProvider::new(
                gigachat.auth_key.clone(),
                gigachat.scope.clone(),
                gigachat.verify_tls,
                Duration::from_secs(llm.gigachat_timeout_seconds),
            )),
        );
    }

    info!(
        providers = ?map.keys().collect::<Vec<_>>(),
        "provider adapters configured"
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::config::{AnthropicConfig, OpenAiConfig};

    #[test]
    fn builds_only_configured_adapters() {
        let providers = ProvidersConfig {
            openai: Some(OpenAiConfig {
                api_key: "sk-test".to_string(),
                base_url: "https://api.openai.com".to_string(),
            }),
            anthropic: Some(AnthropicConfig {
                api_key: "sk-ant".to_string(),
                base_url: "https://api.anthropic.com".to_string(),
            }),
            gigachat: None,
        };
        let map = build_providers(&providers, &LlmConfig::default());
        assert!(map.contains_key("openai"));
        assert!(map.contains_key("anthropic"));
        assert!(!map.contains_key("gigachat"));
        assert_eq!(map["openai"].name(), "openai");
    }

    #[test]
    fn empty_config_builds_nothing() {
        let map = build_providers(&ProvidersConfig::default(), &LlmConfig::default());
        assert!(map.is_empty());
    }
}
