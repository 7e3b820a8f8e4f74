//! Request gate
//!
//! Holds client requests while leadership is unsettled. Reads pass once the
//! node is ready; writes are admitted on the primary, redirected to the
//! primary's proxy on replicas, and refused with 503 when the hold budget
//! runs out or the primary runs no proxy.

use super::leadership::{Coordinator, WriteGuard};
use super::state::LeaseState;
use crate::common::utils::deadline_after;
use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Re-check interval while holding; promotion progress is not broadcast
const RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of admitting a request
pub enum Admission {
    /// Write admitted on the primary; keep the guard until the write completes
    Write(WriteGuard),
    Read,
    /// Send the client to the primary's proxy at this URL
    Redirect(String),
    Unavailable(String),
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Admission::Write(guard) => write!(f, "Write(epoch={})", guard.epoch()),
            Admission::Read => write!(f, "Read"),
            Admission::Redirect(url) => write!(f, "Redirect({})", url),
            Admission::Unavailable(reason) => write!(f, "Unavailable({})", reason),
        }
    }
}

/// Fencing epoch of an admitted write, stored in request extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEpoch(pub u64);

pub struct RequestGate {
    coordinator: Arc<Coordinator>,
    max_hold: Duration,
}

impl RequestGate {
    pub fn new(coordinator: Arc<Coordinator>, max_hold: Duration) -> Self {
        Self {
            coordinator,
            max_hold,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub async fn admit(&self, write: bool) -> Admission {
        let deadline = deadline_after(self.max_hold);

        if tokio::time::timeout_at(deadline, self.coordinator.ready().wait())
            .await
            .is_err()
        {
            return Admission::Unavailable("node is not ready".into());
        }
        if !write {
            return Admission::Read;
        }

        let mut rx = self.coordinator.subscribe();
        loop {
            if self.coordinator.state() == LeaseState::Unleased {
                return Admission::Unavailable("node is shutting down".into());
            }
            if !self.coordinator.is_transitioning() {
                if self.coordinator.is_primary() {
                    // Demotion may win the race; the next pass redirects.
                    if let Ok(guard) = self.coordinator.begin_write().await {
                        return Admission::Write(guard);
                    }
                    continue;
                }
                if let (_, Some(primary)) = self.coordinator.primary_info() {
                    return match primary.proxy_url {
                        Some(url) => Admission::Redirect(url),
                        None => Admission::Unavailable(format!(
                            "primary {} does not accept proxied writes",
                            primary.hostname
                        )),
                    };
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Admission::Unavailable("node is shutting down".into());
                    }
                }
                _ = tokio::time::sleep(RECHECK_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Admission::Unavailable("leadership transition in progress".into());
                }
            }
        }
    }
}

fn is_read(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Axum middleware applying the gate to every request
pub async fn gate_middleware(
    State(gate): State<Arc<RequestGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let write = !is_read(request.method());

    match gate.admit(write).await {
        Admission::Read => next.run(request).await,
        Admission::Write(guard) => {
            request.extensions_mut().insert(WriteEpoch(guard.epoch()));
            let response = next.run(request).await;
            drop(guard);
            response
        }
        Admission::Redirect(primary) => {
            let path = request
                .uri()
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/");
            let location = format!("{}{}", primary, path);
            tracing::debug!(%location, "redirecting write to primary");
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response()
        }
        Admission::Unavailable(reason) => {
            tracing::debug!(%reason, write, "request not admitted");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": reason })),
            )
                .into_response()
        }
    }
}
