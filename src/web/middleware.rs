//! # Admission Middleware
//!
//! Runs every request through the rate limiter keyed by the caller
//! identifier (the `x-organization-id` header, else the anonymous
//! bucket) and the route class (first path segment under `/v1`).
//! Responses carry the `X-RateLimit-*` headers; denials return 429 with
//! `Retry-After`.

use axum::extract::{Request, State};
use axum::http::{header::HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::state::AppState;
use crate::resilience::RateLimitDecision;

const ANONYMOUS_IDENTIFIER: &str = "anonymous";

pub async fn admission_layer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = request
        .headers()
        .get("x-organization-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(ANONYMOUS_IDENTIFIER)
        .to_string();
    let endpoint_class = route_class(request.uri().path());

    let decision = state.rate_limiter.check(&identifier, &endpoint_class);
    if !decision.allowed {
        let retry_after_seconds = decision.reset_in_ms.div_ceil(1000);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate limit exceeded",
                "retry_after_ms": decision.reset_in_ms,
            })),
        )
            .into_response();
        attach_headers(&mut response, &decision);
        if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
        return response;
    }

    let mut response = next.run(request).await;
    attach_headers(&mut response, &decision);
    response
}

fn attach_headers(response: &mut Response, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        let name = HeaderName::from_static(match name {
            "X-RateLimit-Limit" => "x-ratelimit-limit",
            "X-RateLimit-Remaining" => "x-ratelimit-remaining",
            _ => "x-ratelimit-reset",
        });
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
}

/// Route class for the policy table: the first path segment under `/v1`
fn route_class(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .nth(1)
        .unwrap_or("default")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_class_extraction() {
        assert_eq!(route_class("/v1/tasks/abc"), "tasks");
        assert_eq!(route_class("/v1/action-log"), "action-log");
        assert_eq!(route_class("/v1"), "default");
    }
}
