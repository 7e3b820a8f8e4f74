//! Utility functions for minilease

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Percent-encoding set for lock-service key paths (slashes are kept)
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode a key path for use in a URL
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key.trim_start_matches('/'), KEY_ENCODE_SET).to_string()
}

/// Generate a new node ID
pub fn generate_node_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Format a duration the way Consul parses it ("1500ms")
pub fn format_duration(d: Duration) -> String {
    format!("{}ms", d.as_millis())
}

/// Add up to 10% random jitter so polling nodes do not move in lockstep
pub fn jitter(d: Duration) -> Duration {
    let max = (d.as_millis() as u64) / 10;
    if max == 0 {
        return d;
    }
    d.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=max)))
}

/// `d` from now, capped at roughly thirty years
pub fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

/// Expand `${NAME}` references using the process environment.
/// Unknown variables expand to the empty string.
pub fn expand_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
