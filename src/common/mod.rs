//! Common utilities and types shared across minilease

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, ConsulConfig, HttpConfig, LeaseConfig, ProxyConfig};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{deadline_after, encode_key, format_duration, generate_node_id, jitter};
