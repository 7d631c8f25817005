//! Rate-limit header parsing.
//!
//! Understands the Anthropic (`anthropic-ratelimit-*`, RFC 3339 resets) and OpenAI
//! (`x-ratelimit-*`, duration resets) families plus `retry-after`/`retry-after-ms`.
//! Anything that does not parse is left unknown.

use chrono::DateTime;

use crate::clock::Timestamp;

use super::QuotaWindow;

/// Parses quota headers into a window. Header names are matched case-insensitively.
pub fn parse_quota_headers<I, K, V>(headers: I, now: Timestamp) -> QuotaWindow
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut window = QuotaWindow::default();
    let mut resets: Vec<Timestamp> = Vec::new();

    for (name, value) in headers {
        let name = name.as_ref().trim().to_ascii_lowercase();
        let value = value.as_ref().trim();
        match name.as_str() {
            "anthropic-ratelimit-requests-remaining" | "x-ratelimit-remaining-requests" => {
                window.requests_remaining = value.parse().ok().or(window.requests_remaining);
            }
            "anthropic-ratelimit-tokens-remaining" | "x-ratelimit-remaining-tokens" => {
                window.tokens_remaining = value.parse().ok().or(window.tokens_remaining);
            }
            "anthropic-ratelimit-requests-reset" | "anthropic-ratelimit-tokens-reset" => {
                if let Ok(at) = DateTime::parse_from_rfc3339(value) {
                    resets.push(at.timestamp_millis());
                }
            }
            "x-ratelimit-reset-requests" | "x-ratelimit-reset-tokens" => {
                if let Some(ms) = parse_duration_ms(value) {
                    resets.push(now.saturating_add(ms as i64));
                }
            }
            _ => {}
        }
    }

    // The earliest reset wins: past it, at least one remaining count is stale.
    window.reset_at = resets.into_iter().min();
    window
}

/// Provider retry hint in milliseconds, from `retry-after-ms` or `retry-after`
/// (delta seconds or an HTTP date).
pub fn parse_retry_after<I, K, V>(headers: I, now: Timestamp) -> Option<u64>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut seconds_hint = None;
    for (name, value) in headers {
        let value = value.as_ref().trim();
        match name.as_ref().trim().to_ascii_lowercase().as_str() {
            "retry-after-ms" => {
                if let Ok(ms) = value.parse::<f64>()
                    && ms.is_finite()
                    && ms >= 0.0
                {
                    return Some(ms as u64);
                }
            }
            "retry-after" => {
                seconds_hint = value
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(|s| (s * 1000.0) as u64)
                    .or_else(|| {
                        DateTime::parse_from_rfc2822(value)
                            .ok()
                            .map(|at| (at.timestamp_millis() - now).max(0) as u64)
                    });
            }
            _ => {}
        }
    }
    seconds_hint
}

/// Parses Go-style durations as sent by OpenAI: `20ms`, `1s`, `6m0s`, `1h2m3.5s`.
pub fn parse_duration_ms(value: &str) -> Option<u64> {
    let mut total = 0.0_f64;
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let amount: f64 = number.parse().ok()?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let factor = match unit {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        total += amount * factor;
        rest = tail;
    }

    (total.is_finite() && total >= 0.0).then_some(total.round() as u64)
}
