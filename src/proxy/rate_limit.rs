//! Upstream response classification and rate-limit header parsing.
//!
//! Classification happens in exactly one place (the proxy engine calls in
//! here); everything below the engine returns typed errors up to it.

use axum::http::HeaderMap;
use chrono::DateTime;

/// What the engine does with an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx: stream it back
    Success,
    /// 429: lock the account, next candidate
    RateLimited,
    /// 401/403: invalidate the cached token, next candidate, no same-account retry
    AuthFailed,
    /// other 4xx: surface verbatim, no failover
    ClientError,
    /// 5xx: retry this candidate with backoff, then next
    UpstreamTransient,
}

pub fn classify_status(status: u16) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        401 | 403 => ResponseClass::AuthFailed,
        429 => ResponseClass::RateLimited,
        400..=499 => ResponseClass::ClientError,
        _ => ResponseClass::UpstreamTransient,
    }
}

/// Lock applied to a 429'd account, parsed from response headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    /// When the account may be considered again, epoch ms
    pub until: Option<u64>,
    /// Vendor status text (e.g. "allowed_warning", "rejected")
    pub status_text: Option<String>,
    /// Remaining budget in the current window, when reported
    pub remaining: Option<i64>,
    /// Window reset, epoch ms, when reported distinctly from retry-after
    pub reset: Option<u64>,
    /// Verbatim retry-after in seconds, for the client-facing 503 header
    pub retry_after_secs: Option<u64>,
}

/// Lock duration applied when a 429 carries no usable timing headers.
const DEFAULT_LOCK_MS: u64 = 60_000;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `retry-after` is either delta-seconds or an HTTP date.
fn parse_retry_after(value: &str, now_ms: u64) -> Option<u64> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(secs);
    }
    let date = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let target_ms = date.timestamp_millis().max(0) as u64;
    Some(target_ms.saturating_sub(now_ms) / 1000)
}

/// Reset headers carry epoch seconds.
fn parse_reset_epoch(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().map(|secs| secs * 1000)
}

/// Extract the rate-limit lock for an account from upstream headers.
///
/// Precedence for the lock expiry: `retry-after` wins (it is the vendor's
/// explicit instruction), then the unified reset timestamp, then a fixed
/// default so a 429 always locks for a nonzero interval.
pub fn parse_rate_limit(headers: &HeaderMap, now_ms: u64) -> RateLimitInfo {
    let retry_after_secs =
        header_str(headers, "retry-after").and_then(|v| parse_retry_after(v, now_ms));

    let reset = header_str(headers, "anthropic-ratelimit-unified-reset")
        .or_else(|| header_str(headers, "x-ratelimit-reset"))
        .and_then(parse_reset_epoch);

    let status_text = header_str(headers, "anthropic-ratelimit-unified-status")
        .map(|s| s.to_string());

    let remaining = header_str(headers, "anthropic-ratelimit-unified-remaining")
        .or_else(|| header_str(headers, "x-ratelimit-remaining"))
        .and_then(|v| v.trim().parse::<i64>().ok());

    let until = retry_after_secs
        .map(|secs| now_ms + secs * 1000)
        .or(reset.filter(|&r| r > now_ms))
        .or(Some(now_ms + DEFAULT_LOCK_MS));

    RateLimitInfo {
        until,
        status_text,
        remaining,
        reset,
        retry_after_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(classify_status(200), ResponseClass::Success);
        assert_eq!(classify_status(204), ResponseClass::Success);
        assert_eq!(classify_status(401), ResponseClass::AuthFailed);
        assert_eq!(classify_status(403), ResponseClass::AuthFailed);
        assert_eq!(classify_status(429), ResponseClass::RateLimited);
        assert_eq!(classify_status(400), ResponseClass::ClientError);
        assert_eq!(classify_status(404), ResponseClass::ClientError);
        assert_eq!(classify_status(500), ResponseClass::UpstreamTransient);
        assert_eq!(classify_status(503), ResponseClass::UpstreamTransient);
    }

    #[test]
    fn test_retry_after_seconds() {
        let now = 1_000_000;
        let info = parse_rate_limit(&headers(&[("retry-after", "120")]), now);
        assert_eq!(info.retry_after_secs, Some(120));
        assert_eq!(info.until, Some(now + 120_000));
    }

    #[test]
    fn test_retry_after_http_date() {
        // A date roughly 60s after `now`
        let now_ms = 1_700_000_000_000u64;
        let date = DateTime::from_timestamp_millis((now_ms + 60_000) as i64)
            .unwrap()
            .to_rfc2822();
        let info = parse_rate_limit(&headers(&[("retry-after", &date)]), now_ms);
        let secs = info.retry_after_secs.unwrap();
        assert!((59..=61).contains(&secs), "got {secs}");
    }

    #[test]
    fn test_unified_reset_used_without_retry_after() {
        let now = 1_700_000_000_000u64;
        let reset_secs = (now / 1000) + 300;
        let info = parse_rate_limit(
            &headers(&[
                ("anthropic-ratelimit-unified-reset", &reset_secs.to_string()),
                ("anthropic-ratelimit-unified-status", "rejected"),
                ("anthropic-ratelimit-unified-remaining", "0"),
            ]),
            now,
        );
        assert_eq!(info.until, Some(reset_secs * 1000));
        assert_eq!(info.status_text.as_deref(), Some("rejected"));
        assert_eq!(info.remaining, Some(0));
    }

    #[test]
    fn test_retry_after_wins_over_reset() {
        let now = 1_700_000_000_000u64;
        let reset_secs = (now / 1000) + 300;
        let info = parse_rate_limit(
            &headers(&[
                ("retry-after", "30"),
                ("anthropic-ratelimit-unified-reset", &reset_secs.to_string()),
            ]),
            now,
        );
        assert_eq!(info.until, Some(now + 30_000));
        // Reset is still recorded for the account row
        assert_eq!(info.reset, Some(reset_secs * 1000));
    }

    #[test]
    fn test_bare_429_gets_default_lock() {
        let now = 1_000_000;
        let info = parse_rate_limit(&headers(&[]), now);
        assert_eq!(info.until, Some(now + DEFAULT_LOCK_MS));
        assert_eq!(info.retry_after_secs, None);
    }

    #[test]
    fn test_stale_reset_falls_back_to_default() {
        let now = 1_700_000_000_000u64;
        let stale_secs = now / 1000 - 10;
        let info = parse_rate_limit(
            &headers(&[("anthropic-ratelimit-unified-reset", &stale_secs.to_string())]),
            now,
        );
        assert_eq!(info.until, Some(now + DEFAULT_LOCK_MS));
    }
}
