//! Request-holding HTTP proxy in front of the application
//!
//! Every request passes through the [`RequestGate`] before being forwarded
//! to the target. Admitted writes carry their fencing epoch to the
//! application in the `X-Lease-Epoch` header.

use super::gate::{gate_middleware, RequestGate, WriteEpoch};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    Json, Router,
};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Header carrying the fencing epoch of an admitted write
pub const EPOCH_HEADER: &str = "X-Lease-Epoch";

/// Headers that describe a single connection and are not forwarded
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    target: Arc<str>,
}

/// Build the proxy router forwarding to `target`
pub fn create_proxy_router(
    gate: Arc<RequestGate>,
    target: &str,
    max_body_bytes: usize,
    timeout: Duration,
) -> Result<Router> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::Internal(format!("cannot build proxy client: {}", e)))?;

    let state = ProxyState {
        client,
        target: Arc::from(target.trim_end_matches('/')),
    };

    Ok(Router::new()
        .fallback(forward)
        .with_state(state)
        .layer(middleware::from_fn_with_state(gate, gate_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_tracing_middleware))
                .layer(RequestBodyLimitLayer::new(max_body_bytes)),
        ))
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !HOP_BY_HOP.contains(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

async fn forward(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.target, path);

    let body: Bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
    };

    let mut headers = HeaderMap::new();
    copy_headers(&parts.headers, &mut headers);
    if let Some(WriteEpoch(epoch)) = parts.extensions.get::<WriteEpoch>() {
        headers.insert(EPOCH_HEADER, HeaderValue::from(*epoch));
    }

    let upstream = match state
        .client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(%url, error = %e, "cannot reach proxy target");
            return error_response(StatusCode::BAD_GATEWAY, format!("upstream: {}", e));
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, format!("upstream body: {}", e)),
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    copy_headers(&upstream_headers, response.headers_mut());
    response
}
