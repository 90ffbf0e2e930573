//! Sliding-window admission over a Redis sorted set. Each identity keeps a
//! set of request timestamps; entries older than the window are dropped,
//! the remainder counted, and the request admitted if under the limit.
//! A missing or failing Redis degrades to allow — the ledger's balance
//! check stays the authoritative backstop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use tollgate_core::config::RateLimitConfig;
use tollgate_core::ApiError;

use crate::app::{is_public_path, AppState};
use crate::envelope::Identity;
use crate::error::Failure;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix timestamp when the window resets.
    pub reset_at: i64,
}

pub struct RateLimiter {
    requests: u32,
    window_seconds: u64,
    enabled: bool,
    conn: Option<ConnectionManager>,
}

impl RateLimiter {
    /// Connect to the counter store. Failure to connect is logged and the
    /// limiter runs degraded (allow-all) rather than blocking startup.
    pub async fn connect(config: &RateLimitConfig) -> Self {
        let conn = match (&config.redis_url, config.enabled) {
            (Some(url), true) => match redis::Client::open(url.as_str()) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        warn!(error = %e, "rate limiter: redis unreachable, running degraded");
                        None
                    }
                },
                Err(e) => {
                    warn!(error = %e, "rate limiter: bad redis url, running degraded");
                    None
                }
            },
            _ => None,
        };
        Self {
            requests: config.requests,
            window_seconds: config.window_seconds,
            enabled: config.enabled,
            conn,
        }
    }

    /// Limiter with no backend, for tests. Always admits.
    #[cfg(test)]
    pub fn disabled(config: &RateLimitConfig) -> Self {
        Self {
            requests: config.requests,
            window_seconds: config.window_seconds,
            enabled: false,
            conn: None,
        }
    }

    pub fn limit(&self) -> u32 {
        self.requests
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    pub fn backend_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn allow_all(&self) -> RateDecision {
        RateDecision {
            allowed: true,
            remaining: self.requests,
            reset_at: unix_now() + self.window_seconds as i64,
        }
    }

    /// Sliding-window check for one identity. Any Redis failure admits the
    /// request with a warning.
    pub async fn check(&self, identifier: &str) -> RateDecision {
        if !self.enabled {
            return self.allow_all();
        }
        let Some(conn) = self.conn.clone() else {
            return self.allow_all();
        };

        match self.check_with_redis(conn, identifier).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, identifier, "rate limiter error, allowing request");
                self.allow_all()
            }
        }
    }

    async fn check_with_redis(
        &self,
        mut conn: ConnectionManager,
        identifier: &str,
    ) -> redis::RedisResult<RateDecision> {
        let key = format!("rate_limit:{identifier}");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let window = self.window_seconds as f64;
        let reset_at = now as i64 + self.window_seconds as i64;

        // drop entries that left the window
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0f64)
            .arg(now - window)
            .query_async(&mut conn)
            .await?;

        let count: u32 = redis::cmd("ZCARD").arg(&key).query_async(&mut conn).await?;

        if count >= self.requests {
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }

        // admit: record this request and keep the key from leaking
        let member = format!("{now}:{}", Uuid::new_v4());
        let _: i64 = redis::cmd("ZADD")
            .arg(&key)
            .arg(now)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.window_seconds + 1)
            .query_async(&mut conn)
            .await?;

        Ok(RateDecision {
            allowed: true,
            remaining: self.requests.saturating_sub(count + 1),
            reset_at,
        })
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Signed-in callers are limited per user; anonymous traffic per client IP,
/// honoring the first entry of X-Forwarded-For.
pub(crate) fn identifier(req: &Request) -> String {
    if let Some(identity) = req.extensions().get::<Identity>() {
        return format!("user:{}", identity.user_id);
    }
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let ip = forwarded.unwrap_or_else(|| {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    });
    format!("ip:{ip}")
}

pub async fn rate_limit_mw(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if is_public_path(req.uri().path()) {
        return next.run(req).await;
    }

    let identifier = identifier(&req);
    let decision = state.limiter.check(&identifier).await;
    let limit = state.limiter.limit();
    let window = state.limiter.window_seconds();

    if !decision.allowed {
        warn!(identifier, path = req.uri().path(), "rate limit exceeded");
        let mut response = Failure(ApiError::RateLimited {
            limit,
            window_seconds: window,
            retry_after: decision.reset_at,
        })
        .into_response();
        let headers = response.headers_mut();
        headers.insert("retry-after", header_value(window));
        headers.insert("x-ratelimit-limit", header_value(limit));
        headers.insert("x-ratelimit-remaining", header_value(0u32));
        headers.insert("x-ratelimit-reset", header_value(decision.reset_at));
        return response;
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", header_value(limit));
    headers.insert("x-ratelimit-remaining", header_value(decision.remaining));
    headers.insert("x-ratelimit-reset", header_value(decision.reset_at));
    response
}

fn header_value(v: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&v.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request() -> Request {
        Request::builder().uri("/api/v1/dialogs").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn degraded_limiter_always_admits() {
        let limiter = RateLimiter::connect(&RateLimitConfig {
            enabled: true,
            requests: 5,
            window_seconds: 60,
            redis_url: None,
        })
        .await;
        assert!(!limiter.backend_connected());
        for _ in 0..20 {
            let decision = limiter.check("user:1").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 5);
        }
    }

    #[tokio::test]
    async fn disabled_limiter_admits() {
        let limiter = RateLimiter::disabled(&RateLimitConfig::default());
        assert!(limiter.check("ip:1.2.3.4").await.allowed);
    }

    #[test]
    fn identity_prefers_user_over_ip() {
        let mut req = request();
        req.extensions_mut().insert(Identity {
            user_id: 42,
            is_admin: false,
        });
        assert_eq!(identifier(&req), "user:42");
    }

    #[test]
    fn anonymous_uses_first_forwarded_entry() {
        let mut req = request();
        req.headers_mut().insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(identifier(&req), "ip:203.0.113.9");

        let mut req = request();
        req.extensions_mut().insert(ConnectInfo(
            "198.51.100.7:4242".parse::<SocketAddr>().unwrap(),
        ));
        assert_eq!(identifier(&req), "ip:198.51.100.7");

        assert_eq!(identifier(&request()), "ip:unknown");
    }
}
