//! 凭据比较与随机值工具

use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 常量时间比较
///
/// 两侧先各自做 SHA-256，再用 `subtle` 比较定长摘要，耗时与输入长度无关。
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let left = Sha256::digest(a.as_bytes());
    let right = Sha256::digest(b.as_bytes());
    left.as_slice().ct_eq(right.as_slice()).into()
}

/// 任一期望值非空且与输入相等
#[must_use]
pub fn matches_any(candidate: &str, expected: &[&str]) -> bool {
    if candidate.is_empty() {
        return false;
    }
    // 不短路：每个期望值都参与比较
    expected
        .iter()
        .filter(|value| !value.is_empty())
        .fold(false, |acc, value| constant_time_eq(candidate, value) | acc)
}

/// 日志用脱敏
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let visible: String = trimmed.chars().take(6).collect();
    format!("{visible}***")
}

/// `n` 个随机字节的十六进制串
#[must_use]
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 十六进制摘要
#[must_use]
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret-token", "secret-token"));
        assert!(!constant_time_eq("secret-token", "secret-tokeN"));
        assert!(!constant_time_eq("secret", "secret-token"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_matches_any_ignores_empty_expected() {
        assert!(!matches_any("", &["", ""]));
        assert!(!matches_any("x", &["", "y"]));
        assert!(matches_any("y", &["", "y"]));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("eyJhbGciOiJIUzI1NiJ9"), "eyJhbG***");
        assert_eq!(mask_secret("  "), "");
    }

    #[test]
    fn test_random_hex_length_and_uniqueness() {
        let a = random_hex(16);
        let b = random_hex(16);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
