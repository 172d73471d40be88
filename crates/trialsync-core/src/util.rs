//! Shared utility functions used across multiple modules.

use std::time::Duration;

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current time as an RFC 3339 string (UTC, millisecond precision).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Trim a value and treat empty strings as absent.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Whether `value` uses the http or https scheme.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Saturating conversion of a millisecond `Duration` for logs and metrics.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Convert a stored SQLite integer into a version counter.
pub(crate) fn version_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert a version counter into a SQLite integer.
pub(crate) fn version_to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(!is_http_url("ftp://example.com"));
    }

    #[test]
    fn compact_text_trims_and_truncates() {
        assert_eq!(compact_text("  hello  "), "hello");
        assert_eq!(compact_text(&"x".repeat(500)).len(), 180);
    }

    #[test]
    fn version_conversion_saturates() {
        assert_eq!(version_from_sql(-4), 0);
        assert_eq!(version_to_sql(u64::MAX), i64::MAX);
        assert_eq!(version_from_sql(version_to_sql(42)), 42);
    }

    #[test]
    fn rfc3339_timestamp_is_utc() {
        assert!(now_rfc3339().ends_with('Z'));
        assert!(now_millis() > 0);
    }
}
