use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use tollgate_chat::Chat;
use tollgate_core::auth::JwtValidator;
use tollgate_core::config::TollgateConfig;
use tollgate_core::events::EventBus;
use tollgate_ledger::Ledger;
use tollgate_provider::{factory, ModelRegistry};
use tollgate_store::Db;

use crate::envelope;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;

/// Central shared state — passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: TollgateConfig,
    pub db: Arc<Db>,
    pub ledger: Arc<Ledger>,
    pub registry: Arc<ModelRegistry>,
    pub chat: Arc<Chat>,
    pub events: EventBus,
    pub validator: JwtValidator,
    pub limiter: RateLimiter,
    pub metrics: Metrics,
}

impl AppState {
    /// Wire every subsystem: database + schema, model registry snapshot,
    /// provider adapters, ledger, orchestrator, limiter connection.
    pub async fn build(config: TollgateConfig) -> anyhow::Result<Self> {
        let db = Arc::new(Db::open(&config.database.path)?);
        let registry = Arc::new(ModelRegistry::load(&db)?);
        let events = EventBus::new();
        let ledger = Arc::new(Ledger::new(db.clone(), events.clone()));
        let providers = factory::build_providers(&config.providers, &config.llm);
        let chat = Arc::new(Chat::new(
            db.clone(),
            ledger.clone(),
            registry.clone(),
            providers,
            events.clone(),
        ));
        let validator = JwtValidator::new(&config.auth);
        let limiter = RateLimiter::connect(&config.rate_limit).await;

        Ok(Self {
            config,
            db,
            ledger,
            registry,
            chat,
            events,
            validator,
            limiter,
            metrics: Metrics::new(),
        })
    }

    /// Test constructor over an in-memory database, no limiter backend.
    #[cfg(test)]
    pub fn for_tests(config: TollgateConfig) -> Self {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let registry = Arc::new(ModelRegistry::load(&db).unwrap());
        let events = EventBus::new();
        let ledger = Arc::new(Ledger::new(db.clone(), events.clone()));
        let chat = Arc::new(Chat::new(
            db.clone(),
            ledger.clone(),
            registry.clone(),
            Default::default(),
            events.clone(),
        ));
        let validator = JwtValidator::new(&config.auth);
        let limiter = RateLimiter::disabled(&config.rate_limit);

        Self {
            config,
            db,
            ledger,
            registry,
            chat,
            events,
            validator,
            limiter,
            metrics: Metrics::new(),
        }
    }
}

/// Paths that bypass authentication and rate limiting.
pub fn is_public_path(path: &str) -> bool {
    const PUBLIC_PREFIXES: &[&str] = &["/health", "/metrics", "/docs", "/redoc", "/openapi.json"];
    PUBLIC_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

/// Assemble the full router. Layer order (outermost first): CORS → envelope
/// (request id, logging, metrics) → auth → rate limit → handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.gateway.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .gateway
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    let api = Router::new()
        .route(
            "/dialogs",
            post(crate::http::dialogs::create_dialog).get(crate::http::dialogs::list_dialogs),
        )
        .route("/dialogs/{id}", get(crate::http::dialogs::get_dialog))
        .route(
            "/dialogs/{id}/messages",
            post(crate::http::messages::send_message_stream)
                .get(crate::http::messages::list_messages),
        )
        .route(
            "/dialogs/{id}/messages/sync",
            post(crate::http::messages::send_message_sync),
        )
        .route("/users/me/tokens", get(crate::http::tokens::my_tokens))
        .route("/models", get(crate::http::models::list_models))
        .route("/models/{name}", get(crate::http::models::get_model))
        .route("/export", get(crate::http::export::export_dialogs))
        .route(
            "/export/import",
            post(crate::http::export::import_dialogs),
        )
        .route("/admin/audit", get(crate::http::admin::audit_logs))
        .route("/admin/users", get(crate::http::admin::list_users))
        .route("/admin/users/{id}", get(crate::http::admin::user_details))
        .route(
            "/admin/users/{id}/limits",
            patch(crate::http::admin::set_limit),
        )
        .route(
            "/admin/users/{id}/tokens",
            post(crate::http::admin::adjust_tokens),
        )
        .route(
            "/admin/users/{id}/tokens/history",
            get(crate::http::admin::token_history),
        );

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(crate::http::health::health))
        .route("/metrics", get(crate::http::health::metrics))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::ratelimit::rate_limit_mw,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            envelope::auth_mw,
        ))
        .layer(middleware::from_fn_with_state(state, envelope::envelope_mw))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
}
