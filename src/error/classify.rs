//! # 上游错误分类
//!
//! 根据错误文本（或 HTTP 状态码）判断是否应该重试、是否切换账号，以及账号应被标记的状态。

use std::error::Error as StdError;

use super::ProxyError;

/// 账号状态：额度耗尽
pub const STATUS_QUOTA_EXCEEDED: &str = "quota_exceeded";
/// 账号状态：限流冷却
pub const STATUS_RATE_LIMITED: &str = "429";

/// 上游错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorCategory {
    Canceled,
    Auth,
    AuthBlocked,
    Client,
    RateLimit,
    Timeout,
    Network,
    Server,
    Unknown,
}

impl UpstreamErrorCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::Auth => "auth",
            Self::AuthBlocked => "auth_blocked",
            Self::Client => "client",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamErrorInfo {
    pub category: UpstreamErrorCategory,
    pub retryable: bool,
    pub switch_account: bool,
}

impl UpstreamErrorInfo {
    const fn new(category: UpstreamErrorCategory, retryable: bool, switch_account: bool) -> Self {
        Self {
            category,
            retryable,
            switch_account,
        }
    }
}

/// 错误文本里是否显式出现了某个 HTTP 状态码（如 "HTTP 401"、"status=429"）
#[must_use]
pub fn has_explicit_http_status(lower: &str, code: &str) -> bool {
    const PATTERNS: [&str; 14] = [
        "http ",
        "http/1.1 ",
        "http/2 ",
        "status ",
        "status=",
        "status:",
        "statuscode ",
        "statuscode=",
        "status code ",
        "code ",
        "code=",
        "code:",
        "response status ",
        "response code ",
    ];
    let code = code.trim();
    if code.is_empty() || lower.is_empty() {
        return false;
    }
    PATTERNS
        .iter()
        .any(|prefix| lower.contains(&format!("{prefix}{code}")))
}

fn mentions_quota_exhaustion(lower: &str) -> bool {
    [
        "too many requests",
        "rate limit",
        "no remaining quota",
        "out of credits",
        "credits exhausted",
        "run out of credits",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

fn is_transient_network(lower: &str) -> bool {
    lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("unexpected eof")
        || lower.contains("use of closed")
        || lower.contains("broken pipe")
        || lower.ends_with(": eof")
        || lower == "eof"
}

fn is_timeout(lower: &str) -> bool {
    lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline exceeded")
}

/// 将错误文本映射为账号状态码字符串；不构成账号级问题时返回空串
#[must_use]
pub fn classify_account_status(message: &str) -> String {
    let lower = message.to_lowercase();
    // 模型名错误不应污染账号状态
    if lower.contains("model is not found") || lower.contains("model not found") {
        return String::new();
    }
    if lower.contains("quota_exceeded") || lower.contains("quota exceeded") {
        return STATUS_QUOTA_EXCEEDED.to_string();
    }
    let status = if has_explicit_http_status(&lower, "401")
        || lower.contains("signed out")
        || lower.contains("signed_out")
        || lower.contains("unauthorized")
    {
        "401"
    } else if has_explicit_http_status(&lower, "403") || lower.contains("forbidden") {
        "403"
    } else if has_explicit_http_status(&lower, "404") {
        "404"
    } else if has_explicit_http_status(&lower, "429") || mentions_quota_exhaustion(&lower) {
        STATUS_RATE_LIMITED
    } else {
        ""
    };
    status.to_string()
}

/// 按错误文本分类上游错误
#[must_use]
pub fn classify_upstream_message(message: &str) -> UpstreamErrorInfo {
    use UpstreamErrorCategory as C;

    let lower = message.to_lowercase();
    if lower.contains("canceled") || lower.contains("cancelled") || lower.contains("操作已取消") {
        return UpstreamErrorInfo::new(C::Canceled, false, false);
    }
    if lower.contains("熔断器已打开") || lower.contains("circuit breaker is open") {
        return UpstreamErrorInfo::new(C::Unknown, false, false);
    }
    if has_explicit_http_status(&lower, "401")
        || lower.contains("signed out")
        || lower.contains("signed_out")
    {
        return UpstreamErrorInfo::new(C::Auth, true, true);
    }
    if has_explicit_http_status(&lower, "403") {
        return UpstreamErrorInfo::new(C::AuthBlocked, true, true);
    }
    if has_explicit_http_status(&lower, "404") {
        return UpstreamErrorInfo::new(C::AuthBlocked, false, false);
    }
    if lower.contains("input is too long") || has_explicit_http_status(&lower, "400") {
        return UpstreamErrorInfo::new(C::Client, false, false);
    }
    if has_explicit_http_status(&lower, "429") || mentions_quota_exhaustion(&lower) {
        return UpstreamErrorInfo::new(C::RateLimit, true, true);
    }
    if is_timeout(&lower) {
        return UpstreamErrorInfo::new(C::Timeout, true, true);
    }
    if is_transient_network(&lower) {
        return UpstreamErrorInfo::new(C::Network, true, true);
    }
    if ["500", "502", "503", "504"]
        .iter()
        .any(|code| has_explicit_http_status(&lower, code))
    {
        return UpstreamErrorInfo::new(C::Server, true, true);
    }
    UpstreamErrorInfo::new(C::Unknown, true, true)
}

/// 带完整错误链的文本，供分类使用
#[must_use]
pub fn error_chain_text(err: &ProxyError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// 分类一个 `ProxyError`
#[must_use]
pub fn classify_upstream_error(err: &ProxyError) -> UpstreamErrorInfo {
    use UpstreamErrorCategory as C;

    match err.root() {
        ProxyError::Cancelled { .. } => UpstreamErrorInfo::new(C::Canceled, false, false),
        ProxyError::CircuitOpen { .. } => UpstreamErrorInfo::new(C::Unknown, false, false),
        ProxyError::Validation { .. } => UpstreamErrorInfo::new(C::Client, false, false),
        ProxyError::UpstreamTimeout { .. } => UpstreamErrorInfo::new(C::Timeout, true, true),
        _ => classify_upstream_message(&error_chain_text(err)),
    }
}

/// 是否值得重试
#[must_use]
pub fn is_retryable(err: &ProxyError) -> bool {
    classify_upstream_error(err).retryable
}

/// 自动换号条件：上游 403/429，或超时、连接重置、拒绝、断管、EOF 等瞬时网络错误
#[must_use]
pub fn should_switch_account(err: &ProxyError) -> bool {
    if let Some(status) = err.upstream_status() {
        return status == 403 || status == 429;
    }
    let status = classify_account_status(&error_chain_text(err));
    if status == "403" || status == STATUS_RATE_LIMITED {
        return true;
    }
    matches!(
        classify_upstream_error(err).category,
        UpstreamErrorCategory::Timeout | UpstreamErrorCategory::Network
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("warp api error: HTTP 401: expired", "401")]
    #[case("user signed out", "401")]
    #[case("HTTP 403 forbidden", "403")]
    #[case("status=429", "429")]
    #[case("You have run out of credits", "429")]
    #[case("response code 404", "404")]
    #[case("quota_exceeded for this month", "quota_exceeded")]
    #[case("model not found: gpt-9", "")]
    #[case("something odd", "")]
    fn test_classify_account_status(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(classify_account_status(input), expected);
    }

    #[rstest]
    #[case("context canceled", UpstreamErrorCategory::Canceled, false, false)]
    #[case("HTTP 401 unauthorized", UpstreamErrorCategory::Auth, true, true)]
    #[case("HTTP 403", UpstreamErrorCategory::AuthBlocked, true, true)]
    #[case("HTTP 404", UpstreamErrorCategory::AuthBlocked, false, false)]
    #[case("input is too long", UpstreamErrorCategory::Client, false, false)]
    #[case("too many requests", UpstreamErrorCategory::RateLimit, true, true)]
    #[case("read timeout", UpstreamErrorCategory::Timeout, true, true)]
    #[case("connection reset by peer", UpstreamErrorCategory::Network, true, true)]
    #[case("unexpected EOF", UpstreamErrorCategory::Network, true, true)]
    #[case("status code 502", UpstreamErrorCategory::Server, true, true)]
    #[case("weird", UpstreamErrorCategory::Unknown, true, true)]
    fn test_classify_upstream_message(
        #[case] input: &str,
        #[case] category: UpstreamErrorCategory,
        #[case] retryable: bool,
        #[case] switch_account: bool,
    ) {
        let info = classify_upstream_message(input);
        assert_eq!(info.category, category, "input: {input}");
        assert_eq!(info.retryable, retryable);
        assert_eq!(info.switch_account, switch_account);
    }

    #[test]
    fn test_should_switch_account() {
        assert!(should_switch_account(&ProxyError::upstream("grok", 429, "slow down")));
        assert!(should_switch_account(&ProxyError::upstream("warp", 403, "blocked")));
        assert!(!should_switch_account(&ProxyError::upstream("warp", 500, "oops")));
        assert!(should_switch_account(&ProxyError::network("connection refused")));
        assert!(should_switch_account(&ProxyError::upstream_timeout("grok", 1000)));
        assert!(!should_switch_account(&ProxyError::validation("bad input")));
        assert!(!should_switch_account(&ProxyError::circuit_open("warp")));
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        assert!(!is_retryable(&ProxyError::circuit_open("grok")));
        assert!(is_retryable(&ProxyError::upstream("grok", 503, "busy")));
    }
}
