use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Top-level config (tollgate.toml + TOLLGATE_* env overrides).
/// Env keys use `__` as the section separator, e.g.
/// `TOLLGATE_AUTH__JWT_SECRET`, `TOLLGATE_PROVIDERS__OPENAI__API_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            providers: ProvidersConfig::default(),
            rate_limit: RateLimitConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// When true, error bodies include details for 5xx responses too.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Hard cap on inbound message content, in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            cors_origins: Vec::new(),
            debug: false,
            log_level: default_log_level(),
            max_content_length: default_max_content_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JwtAlgorithm {
    HS256,
    RS256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for HS256.
    pub jwt_secret: Option<String>,
    /// JWKS endpoint for RS256.
    pub jwks_url: Option<String>,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: JwtAlgorithm,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwks_url: None,
            algorithm: JwtAlgorithm::HS256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub openai: Option<OpenAiConfig>,
    pub anthropic: Option<AnthropicConfig>,
    pub gigachat: Option<GigaChatConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    /// Override to point at any OpenAI-protocol server (vLLM, LM Studio, ...).
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GigaChatConfig {
    /// Base64 `client_id:client_secret` pair for the OAuth endpoint.
    pub auth_key: String,
    #[serde(default = "default_gigachat_scope")]
    pub scope: String,
    /// GigaChat serves self-signed certificates; verification is off unless
    /// the operator turns it on.
    #[serde(default)]
    pub verify_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_requests")]
    pub requests: u32,
    #[serde(default = "default_rate_limit_window")]
    pub window_seconds: u64,
    /// Counter store. Absent means the limiter runs in degraded (allow-all)
    /// mode.
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: default_rate_limit_requests(),
            window_seconds: default_rate_limit_window(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Adapter deadline for OpenAI/Anthropic calls.
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    /// GigaChat can be slow; it gets its own deadline.
    #[serde(default = "default_gigachat_timeout")]
    pub gigachat_timeout_seconds: u64,
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_llm_timeout(),
            gigachat_timeout_seconds: default_gigachat_timeout(),
            default_model: default_model(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_content_length() -> usize {
    64 * 1024
}
fn default_db_path() -> String {
    "tollgate.db".to_string()
}
fn default_jwt_algorithm() -> JwtAlgorithm {
    JwtAlgorithm::HS256
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_gigachat_scope() -> String {
    "GIGACHAT_API_PERS".to_string()
}
fn default_rate_limit_requests() -> u32 {
    60
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_llm_timeout() -> u64 {
    30
}
fn default_gigachat_timeout() -> u64 {
    120
}
fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn bool_true() -> bool {
    true
}

impl TollgateConfig {
    /// Load config from a TOML file with TOLLGATE_* env var overrides.
    /// A missing file is fine — env vars and defaults carry the rest.
    pub fn load(config_path: Option<&str>) -> crate::Result<Self> {
        let path = config_path.unwrap_or("tollgate.toml");

        let config: TollgateConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TOLLGATE_").split("__"))
            .extract()
            .map_err(|e| crate::ApiError::Internal(format!("config load failed: {e}")))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = TollgateConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.rate_limit.requests, 60);
        assert_eq!(cfg.llm.timeout_seconds, 30);
        assert_eq!(cfg.llm.gigachat_timeout_seconds, 120);
        assert_eq!(cfg.auth.algorithm, JwtAlgorithm::HS256);
        assert!(cfg.providers.openai.is_none());
    }

    #[test]
    fn env_overrides_apply() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TOLLGATE_GATEWAY__PORT", "9001");
            jail.set_env("TOLLGATE_AUTH__JWT_SECRET", "s3cret");
            jail.set_env("TOLLGATE_RATE_LIMIT__REQUESTS", "5");
            let cfg = TollgateConfig::load(None).expect("load");
            assert_eq!(cfg.gateway.port, 9001);
            assert_eq!(cfg.auth.jwt_secret.as_deref(), Some("s3cret"));
            assert_eq!(cfg.rate_limit.requests, 5);
            Ok(())
        });
    }

    #[test]
    fn toml_file_is_merged() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tollgate.toml",
                r#"
                [gateway]
                port = 8443
                debug = true

                [providers.openai]
                api_key = "sk-test"
                "#,
            )?;
            let cfg = TollgateConfig::load(None).expect("load");
            assert_eq!(cfg.gateway.port, 8443);
            assert!(cfg.gateway.debug);
            let openai = cfg.providers.openai.expect("openai section");
            assert_eq!(openai.api_key, "sk-test");
            assert_eq!(openai.base_url, "https://api.openai.com");
            Ok(())
        });
    }
}
