//! 账号可用性判定
//!
//! 纯函数，不做任何 I/O；需要落库的状态变化由调用方根据返回值处理。

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::store::{Account, STATUS_QUOTA_EXCEEDED, STATUS_RATE_LIMITED};

/// 判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// 冷却或配额窗口已过，可用，调用方应清除状态
    Recovered,
    /// 首次发现配额耗尽，不可用，调用方应记录重置时间
    QuotaPending(DateTime<Utc>),
    Unavailable,
}

impl Availability {
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available | Self::Recovered)
    }
}

/// 按状态码判定账号是否可参与调度
pub fn evaluate_availability<Tz: TimeZone>(
    account: &Account,
    now: DateTime<Utc>,
    cooldown: Duration,
    tz: &Tz,
) -> Availability {
    match account.status_code.trim() {
        "" => Availability::Available,
        STATUS_RATE_LIMITED => match account.last_attempt {
            Some(last) if now - last >= cooldown => Availability::Recovered,
            _ => Availability::Unavailable,
        },
        STATUS_QUOTA_EXCEEDED => match account.quota_reset_at {
            None => next_month_start(now, tz)
                .map_or(Availability::Unavailable, Availability::QuotaPending),
            Some(reset_at) if now > reset_at => Availability::Recovered,
            Some(_) => Availability::Unavailable,
        },
        _ => Availability::Unavailable,
    }
}

/// `now` 所在时区下个自然月第一天 00:00
pub fn next_month_start<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
    let local = now.with_timezone(tz);
    let (year, month) = if local.month() == 12 {
        (local.year() + 1, 1)
    } else {
        (local.year(), local.month() + 1)
    };
    tz.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .earliest()
        // 午夜恰逢夏令时跳变时取 01:00
        .or_else(|| tz.with_ymd_and_hms(year, month, 1, 1, 0, 0).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use rstest::rstest;

    fn account(status: &str) -> Account {
        Account {
            status_code: status.to_string(),
            ..Account::default()
        }
    }

    fn cst() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[rstest]
    #[case("", Availability::Available)]
    #[case("401", Availability::Unavailable)]
    #[case("403", Availability::Unavailable)]
    #[case("429", Availability::Unavailable)]
    fn test_static_statuses(#[case] status: &str, #[case] expected: Availability) {
        let got = evaluate_availability(&account(status), Utc::now(), Duration::minutes(60), &Utc);
        assert_eq!(got, expected);
    }

    #[test]
    fn test_rate_limit_cooldown() {
        let now = Utc::now();
        let mut acc = account("429");
        acc.last_attempt = Some(now - Duration::minutes(59));
        assert_eq!(
            evaluate_availability(&acc, now, Duration::minutes(60), &Utc),
            Availability::Unavailable
        );
        acc.last_attempt = Some(now - Duration::minutes(61));
        assert_eq!(
            evaluate_availability(&acc, now, Duration::minutes(60), &Utc),
            Availability::Recovered
        );
    }

    #[test]
    fn test_quota_reset_defaults_to_next_month_local() {
        let tz = cst();
        let now = tz
            .with_ymd_and_hms(2025, 7, 14, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let acc = account("quota_exceeded");
        let expected = tz
            .with_ymd_and_hms(2025, 8, 1, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            evaluate_availability(&acc, now, Duration::minutes(60), &tz),
            Availability::QuotaPending(expected)
        );

        let mut acc = acc;
        acc.quota_reset_at = Some(expected);
        let later = tz
            .with_ymd_and_hms(2025, 8, 2, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            evaluate_availability(&acc, now, Duration::minutes(60), &tz),
            Availability::Unavailable
        );
        assert_eq!(
            evaluate_availability(&acc, later, Duration::minutes(60), &tz),
            Availability::Recovered
        );
    }

    #[test]
    fn test_next_month_start_wraps_year() {
        let tz = cst();
        let now = tz
            .with_ymd_and_hms(2025, 12, 31, 23, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let expected = tz.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(next_month_start(now, &tz).unwrap(), expected);
    }
}
