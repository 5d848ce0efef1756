//! 进程内计数器与 Prometheus 文本输出

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// 请求路径上的计数器
#[derive(Debug, Default)]
pub struct Metrics {
    requests: DashMap<(String, u16), AtomicU64>,
    upstream_errors: DashMap<String, AtomicU64>,
    account_switches: AtomicU64,
    stream_events: AtomicU64,
}

/// 渲染时由调用方提供的瞬时值
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub limiter_active: u64,
    pub limiter_total: u64,
    pub limiter_rejected: u64,
    pub batch_tasks: u64,
    pub accounts_enabled: u64,
}

fn escape_label(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, route: &str, status: u16) {
        self.requests
            .entry((route.to_string(), status))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self, provider: &str) {
        self.upstream_errors
            .entry(provider.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch(&self) {
        self.account_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_events(&self, n: u64) {
        self.stream_events.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn requests_for(&self, route: &str, status: u16) -> u64 {
        self.requests
            .get(&(route.to_string(), status))
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// Prometheus 文本格式
    #[must_use]
    pub fn render(&self, gauges: Gauges) -> String {
        let mut out = String::new();

        let mut requests: Vec<((String, u16), u64)> = self
            .requests
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        requests.sort();
        out.push_str("# HELP relay_requests_total Downstream requests by route and status.\n");
        out.push_str("# TYPE relay_requests_total counter\n");
        for ((route, status), value) in requests {
            let _ = writeln!(
                out,
                "relay_requests_total{{route=\"{}\",status=\"{status}\"}} {value}",
                escape_label(&route)
            );
        }

        let mut errors: Vec<(String, u64)> = self
            .upstream_errors
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        errors.sort();
        out.push_str("# HELP relay_upstream_errors_total Upstream failures by provider.\n");
        out.push_str("# TYPE relay_upstream_errors_total counter\n");
        for (provider, value) in errors {
            let _ = writeln!(
                out,
                "relay_upstream_errors_total{{provider=\"{}\"}} {value}",
                escape_label(&provider)
            );
        }

        let counters = [
            (
                "relay_account_switches_total",
                "Retries on a different account.",
                self.account_switches.load(Ordering::Relaxed),
            ),
            (
                "relay_stream_events_total",
                "Upstream events forwarded to clients.",
                self.stream_events.load(Ordering::Relaxed),
            ),
            ("relay_limiter_requests_total", "Requests admitted or rejected by the limiter.", gauges.limiter_total),
            ("relay_limiter_rejected_total", "Requests rejected by the limiter.", gauges.limiter_rejected),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}");
        }

        let gauge_values = [
            ("relay_limiter_active", "Requests holding a limiter slot.", gauges.limiter_active),
            ("relay_batch_tasks", "Batch tasks held in the registry.", gauges.batch_tasks),
            ("relay_accounts_enabled", "Enabled upstream accounts.", gauges.accounts_enabled),
        ];
        for (name, help, value) in gauge_values {
            let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new();
        metrics.record_request("chat", 200);
        metrics.record_request("chat", 200);
        metrics.record_request("chat", 503);
        metrics.record_upstream_error("warp");
        metrics.record_switch();

        assert_eq!(metrics.requests_for("chat", 200), 2);
        let text = metrics.render(Gauges {
            limiter_active: 1,
            ..Gauges::default()
        });
        assert!(text.contains("relay_requests_total{route=\"chat\",status=\"200\"} 2"));
        assert!(text.contains("relay_requests_total{route=\"chat\",status=\"503\"} 1"));
        assert!(text.contains("relay_upstream_errors_total{provider=\"warp\"} 1"));
        assert!(text.contains("relay_account_switches_total 1"));
        assert!(text.contains("# TYPE relay_limiter_active gauge\nrelay_limiter_active 1"));
    }
}
