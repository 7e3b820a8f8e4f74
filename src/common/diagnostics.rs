//! Process-wide diagnostic variables (`/debug/vars`)
//!
//! A single source is published at startup. Later calls are ignored, so
//! tests that start several nodes in one process can call `publish` freely.

use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

/// Something that can describe itself as a JSON document
pub trait Diagnostics: Send + Sync {
    fn vars(&self) -> Value;
}

static PUBLISHED: OnceCell<Weak<dyn Diagnostics>> = OnceCell::new();

/// Publish `source` as the process diagnostics. Returns false if another
/// source was already published.
pub fn publish(source: &Arc<dyn Diagnostics>) -> bool {
    let published = PUBLISHED.set(Arc::downgrade(source)).is_ok();
    if published {
        tracing::debug!("diagnostics published");
    }
    published
}

/// Current diagnostic variables, including leadership metrics
pub fn snapshot() -> Value {
    let metrics = &crate::common::metrics::METRICS;
    let store = PUBLISHED
        .get()
        .and_then(Weak::upgrade)
        .map(|s| s.vars())
        .unwrap_or(Value::Null);

    json!({
        "store": store,
        "leadership": {
            "acquisitions": metrics.acquisitions.get(),
            "acquisition_conflicts": metrics.acquisition_conflicts.get(),
            "renewals": metrics.renewals.get(),
            "renewal_failures": metrics.renewal_failures.get(),
            "demotions": metrics.demotions.get(),
            "handoffs_served": metrics.handoffs_served.get(),
            "promotions_succeeded": metrics.promotions_succeeded.get(),
            "promotions_failed": metrics.promotions_failed.get(),
        },
        "uptime_seconds": metrics.uptime_seconds(),
    })
}
