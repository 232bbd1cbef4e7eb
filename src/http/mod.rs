mod client;

pub use client::build_client;

use std::collections::HashMap;

/// Collect response headers into a map with lowercased names for
/// case-insensitive extract lookups. Non-UTF-8 values are skipped.
pub(crate) fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}
