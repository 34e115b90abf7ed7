// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Formatting helpers shared by the engine and the CLI.

/// Redact the query string and fragment of a URL before it is logged.
///
/// Model hosts routinely hand out signed download links whose query
/// carries a bearer token; only scheme, host and path are kept.
///
/// # Examples
///
/// ```
/// use modeldepot::utils::redact_url;
///
/// let url = "https://cdn.example.com/m.gguf?X-Amz-Signature=abc123";
/// assert_eq!(redact_url(url), "https://cdn.example.com/m.gguf?...");
/// ```
pub fn redact_url(url: &str) -> String {
    match url.find(['?', '#']) {
        Some(idx) => format!("{}?...", &url[..idx]),
        None => url.to_string(),
    }
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Human-readable transfer rate.
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Human-readable remaining time.
pub fn format_eta(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
