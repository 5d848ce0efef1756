//! 从上游响应提取限额信息

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::store::RateLimitInfo;

/// 小于该值的 reset 视为相对秒数，否则视为 epoch 秒
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

fn header_number(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// 解析 reset 值：epoch 秒或距现在的秒数
#[must_use]
pub fn parse_reset(raw: f64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let secs = raw.round() as i64;
    if secs >= EPOCH_THRESHOLD {
        Utc.timestamp_opt(secs, 0).single()
    } else {
        Some(now + chrono::Duration::seconds(secs))
    }
}

/// 解析 `x-ratelimit-limit` / `x-ratelimit-remaining` / `x-ratelimit-reset`
#[must_use]
pub fn from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> RateLimitInfo {
    RateLimitInfo {
        limit: header_number(headers, "x-ratelimit-limit"),
        remaining: header_number(headers, "x-ratelimit-remaining"),
        reset_at: header_number(headers, "x-ratelimit-reset").and_then(|raw| parse_reset(raw, now)),
    }
}

/// 解析 Grok `rate-limits` 接口的 JSON：`remainingQueries` / `totalQueries` / `windowSizeSeconds`
#[must_use]
pub fn from_grok_body(body: &Value, now: DateTime<Utc>) -> RateLimitInfo {
    let number = |key: &str| body.get(key).and_then(Value::as_f64);
    let remaining = number("remainingQueries").or_else(|| number("remainingTokens"));
    let mut limit = number("totalQueries").or_else(|| number("totalTokens"));
    if limit.is_none_or(|l| l <= 0.0) && remaining.is_some_and(|r| r > 0.0) {
        limit = remaining;
    }
    RateLimitInfo {
        limit,
        remaining: remaining.map(|r| r.max(0.0)),
        reset_at: number("windowSizeSeconds").and_then(|w| parse_reset(w, now)),
    }
}
