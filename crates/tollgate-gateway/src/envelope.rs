//! The per-request execution envelope: correlation id allocation, wall-time
//! metrics, start/finish logging, and bearer-token authentication with a
//! public-path bypass.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{request::Parts, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::info;
use uuid::Uuid;

use tollgate_core::ApiError;

use crate::app::{is_public_path, AppState};
use crate::error::Failure;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

#[derive(Clone)]
struct RequestContext {
    request_id: String,
    debug: bool,
}

/// Correlation id of the request currently being served. Empty outside a
/// request scope (e.g. in unit tests that build responses directly).
pub fn current_request_id() -> String {
    REQUEST_CONTEXT
        .try_with(|ctx| ctx.request_id.clone())
        .unwrap_or_default()
}

pub fn debug_enabled() -> bool {
    REQUEST_CONTEXT.try_with(|ctx| ctx.debug).unwrap_or(false)
}

/// Authenticated caller, inserted into request extensions by [`auth_mw`].
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub user_id: i64,
    pub is_admin: bool,
}

/// Extractor handing handlers the authenticated identity.
pub struct Auth(pub Identity);

impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = Failure;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .copied()
            .map(Auth)
            .ok_or_else(|| Failure(ApiError::Unauthorized("Missing credentials".to_string())))
    }
}

/// Outermost middleware: allocate the correlation id, time the request,
/// record the metric, echo `X-Request-ID`, and write the start/finish log
/// lines every other log statement correlates with.
pub async fn envelope_mw(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    info!(request_id, %method, path, "request started");

    let context = RequestContext {
        request_id: request_id.clone(),
        debug: state.config.gateway.debug,
    };
    let mut response = REQUEST_CONTEXT.scope(context, next.run(req)).await;

    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    state.metrics.record(method.as_str(), &path, status, elapsed);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    info!(
        request_id,
        %method,
        path,
        status,
        duration_ms = elapsed.as_millis() as u64,
        "request completed"
    );

    response
}

/// Bearer-token authentication. Public paths skip it entirely; everything
/// else needs a valid JWT, whose claims become the request [`Identity`].
pub async fn auth_mw(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    if is_public_path(req.uri().path()) {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let token = match token {
        Some(token) => token,
        None => {
            return Failure(ApiError::Unauthorized(
                "Missing bearer credentials".to_string(),
            ))
            .into_response()
        }
    };

    match state.validator.validate(&token).await {
        Ok(claims) => {
            req.extensions_mut().insert(Identity {
                user_id: claims.user_id,
                is_admin: claims.is_admin,
            });
            next.run(req).await
        }
        Err(e) => Failure(e).into_response(),
    }
}
