// ============================================================================
// Service Client
// ============================================================================
//
// Reverse-proxy leg of the gateway. Forwards one request to one selected
// instance and reports the outcome to that instance's circuit breaker:
//
// - Any HTTP response (including 4xx/5xx) counts as a success and is
//   returned verbatim
// - Connection errors, timeouts and broken response bodies count as
//   failures and surface as a 500 without upstream detail
//
// No retries happen here.
//
// ============================================================================

use crate::error::{AppError, AppResult};
use crate::gateway::load_balancer::ServiceInstance;
use crate::utils::HEADER_REQUEST_ID;
use axum::body::{Body, Bytes};
use axum::http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Response};
use std::time::Duration;
use uuid::Uuid;

/// Connection-scoped headers that must not be forwarded by a proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// HTTP client for forwarding requests to backend instances
#[derive(Clone)]
pub struct ServiceClient {
    client: reqwest::Client,
}

impl ServiceClient {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            // Redirects belong to the caller, not the gateway
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }

    /// Underlying client, shared with health probes
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Forward a request to `instance` and record the outcome on its breaker
    pub async fn forward_request(
        &self,
        instance: &ServiceInstance,
        timeout: Duration,
        parts: Parts,
        body: Bytes,
    ) -> AppResult<Response<Body>> {
        let target_url = match parts.uri.query() {
            Some(query) => format!("{}{}?{}", instance.url(), parts.uri.path(), query),
            None => format!("{}{}", instance.url(), parts.uri.path()),
        };

        let headers = outbound_headers(&parts.headers);

        let result = self
            .client
            .request(parts.method.clone(), &target_url)
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                instance.breaker().record_failure().await;
                tracing::error!(
                    instance = %instance.url(),
                    method = %parts.method,
                    path = %parts.uri.path(),
                    timeout = e.is_timeout(),
                    error = %e,
                    "Upstream request failed"
                );
                return Err(AppError::Upstream(e));
            }
        };

        let status = response.status();
        let mut response_headers = HeaderMap::new();
        for (key, value) in response.headers() {
            if !is_hop_by_hop(key) {
                response_headers.append(key.clone(), value.clone());
            }
        }

        let body_bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                instance.breaker().record_failure().await;
                tracing::error!(
                    instance = %instance.url(),
                    status = %status,
                    error = %e,
                    "Upstream response body could not be read"
                );
                return Err(AppError::Upstream(e));
            }
        };

        instance.breaker().record_success().await;

        let mut proxied = Response::new(Body::from(body_bytes));
        *proxied.status_mut() = status;
        *proxied.headers_mut() = response_headers;
        Ok(proxied)
    }
}

/// Request headers minus `Host`, hop-by-hop headers and `Content-Length`
/// (recomputed by the client), with a request id added if missing
fn outbound_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 1);
    for (key, value) in incoming {
        if key == header::HOST || key == header::CONTENT_LENGTH || is_hop_by_hop(key) {
            continue;
        }
        headers.append(key.clone(), value.clone());
    }

    if !headers.contains_key(HEADER_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(HeaderName::from_static(HEADER_REQUEST_ID), value);
        }
    }
    headers
}
