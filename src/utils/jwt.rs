//! JWT 检查工具（只解析载荷，不验证签名）

use base64::{
    Engine,
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// 粗略判断是否像 JWT：三段，每段至少 10 个字符
#[must_use]
pub fn is_likely_jwt(token: &str) -> bool {
    let parts: Vec<&str> = token.trim().split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| p.len() >= 10)
}

/// 解码载荷为 JSON 对象；先尝试无填充 URL 编码，再尝试带填充
#[must_use]
pub fn decode_jwt_claims(token: &str) -> Option<Map<String, Value>> {
    let mut parts = token.trim().split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// `exp` 声明对应的过期时间
#[must_use]
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let claims = decode_jwt_claims(token)?;
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Clerk `__client` cookie 的 JWT 带有 `rotating_token` 声明，它不是上游请求用的 bearer
#[must_use]
pub fn jwt_has_rotating_token(token: &str) -> bool {
    decode_jwt_claims(token).is_some_and(|claims| claims.contains_key("rotating_token"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_jwt(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2lnbmF0dXJlLXBhcnQ")
    }

    #[test]
    fn test_decode_claims_and_expiry() {
        let token = make_jwt(&json!({"sub": "user_1", "exp": 1_900_000_000}));
        assert!(is_likely_jwt(&token));
        let claims = decode_jwt_claims(&token).unwrap();
        assert_eq!(claims["sub"], "user_1");
        assert_eq!(jwt_expiry(&token).unwrap().timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_rotating_token_detection() {
        let client = make_jwt(&json!({"rotating_token": "abc", "id": "client_1"}));
        let session = make_jwt(&json!({"sid": "sess_1"}));
        assert!(jwt_has_rotating_token(&client));
        assert!(!jwt_has_rotating_token(&session));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(!is_likely_jwt("a.b.c"));
        assert!(decode_jwt_claims("not-a-jwt").is_none());
        assert!(decode_jwt_claims("aaaaaaaaaa.!!!!!!!!!!.bbbbbbbbbb").is_none());
        assert!(jwt_expiry("").is_none());
    }
}
