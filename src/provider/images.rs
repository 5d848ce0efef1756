//! # 图片链接归一化
//!
//! 上游返回的图片链接混杂着本地缓存、CDN 原图、`-part-0` 预览图以及任意外链。
//! 这里给每个链接打分，去掉有原图的预览图，再按分数降序、链接升序排列。

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use url::Url;

const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".webp", ".gif"];

/// 分数不低于该值的链接视为 Grok 自有（或本地缓存）资源
pub const PREFERRED_SCORE: i32 = 700;

static IMAGE_URL_IN_TEXT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"')>]+\.(?:png|jpe?g|webp|gif)(?:\?[^\s"')>]*)?"#).ok()
});

fn is_local_file_path(lower: &str) -> bool {
    lower.starts_with("/grok/v1/files/image/") || lower.starts_with("/v1/files/image/")
}

/// 看起来是否像图片链接
#[must_use]
pub fn is_likely_image_url(raw: &str) -> bool {
    let u = raw.trim();
    if u.is_empty() {
        return false;
    }
    let lower = u.to_lowercase();
    if is_local_file_path(&lower) {
        return true;
    }
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return false;
    }
    let without_query = lower.split('?').next().unwrap_or_default();
    if IMAGE_EXTENSIONS.iter().any(|ext| without_query.ends_with(ext)) {
        return true;
    }
    lower.contains("assets.grok.com/") && (lower.contains("/generated/") || lower.contains("/image"))
}

/// 看起来是否像 Grok 资源路径（不带域名）
#[must_use]
pub fn is_likely_asset_path(raw: &str) -> bool {
    let p = raw.trim();
    if p.is_empty() || p.starts_with('{') || p.contains("Image Generation:") {
        return false;
    }
    if p.chars().any(char::is_whitespace) {
        return false;
    }
    let lower = p.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// 链接评分；不是图片时返回 -1
#[must_use]
pub fn image_url_score(raw: &str) -> i32 {
    let u = raw.trim();
    if !is_likely_image_url(u) {
        return -1;
    }
    let lower = u.to_lowercase();
    if is_local_file_path(&lower) {
        return 1000;
    }

    let mut score = 100;
    if (lower.starts_with("http://127.0.0.1:") || lower.starts_with("http://localhost:"))
        && (lower.contains("/grok/v1/files/image/") || lower.contains("/v1/files/image/"))
    {
        score = 980;
    }
    if let Ok(parsed) = Url::parse(u) {
        let host = parsed.host_str().unwrap_or_default().to_lowercase();
        if host == "assets.grok.com" {
            score = 900;
        } else if host == "grok.com" || host.ends_with(".grok.com") {
            score = 700;
        } else if host.contains("encrypted-tbn") {
            score = 10;
        }
        let path = parsed.path().to_lowercase();
        if path.contains("/generated/") {
            score += 30;
        }
        if path.contains("/image.") {
            score += 10;
        }
        if path.contains("-part-0/") {
            score -= 120;
        }
        let query = parsed.query().unwrap_or_default().to_lowercase();
        if query.contains("thumb") {
            score -= 30;
        }
    }
    score
}

/// 原图存在时丢弃对应的 `-part-0` 预览
#[must_use]
pub fn prefer_full_over_part(urls: Vec<String>) -> Vec<String> {
    let all: HashSet<String> = urls.iter().cloned().collect();
    urls.into_iter()
        .filter(|u| !(u.contains("-part-0/") && all.contains(&u.replace("-part-0/", "/"))))
        .collect()
}

/// 去重、打分、排序；`prefer_grok` 时只要存在高分链接就只保留高分链接
#[must_use]
pub fn select_image_urls(urls: &[String], prefer_grok: bool) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut all: Vec<(String, i32)> = Vec::with_capacity(urls.len());
    for raw in urls {
        let u = raw.trim();
        if u.is_empty() || !seen.insert(u.to_string()) {
            continue;
        }
        let score = image_url_score(u);
        if score >= 0 {
            all.push((u.to_string(), score));
        }
    }
    if prefer_grok && all.iter().any(|(_, s)| *s >= PREFERRED_SCORE) {
        all.retain(|(_, s)| *s >= PREFERRED_SCORE);
    }
    all.sort_by(|(ua, sa), (ub, sb)| sb.cmp(sa).then_with(|| ua.cmp(ub)));
    prefer_full_over_part(all.into_iter().map(|(u, _)| u).collect())
}

/// 归一化并截断到 `n` 个（`n == 0` 不截断）
#[must_use]
pub fn normalize_image_urls(urls: &[String], n: usize, prefer_grok: bool) -> Vec<String> {
    let mut out = select_image_urls(urls, prefer_grok);
    if n > 0 {
        out.truncate(n);
    }
    out
}

/// 从任意文本中抓取图片链接
#[must_use]
pub fn extract_image_urls_from_text(text: &str) -> Vec<String> {
    let Some(re) = IMAGE_URL_IN_TEXT.as_ref() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// 从上游 JSON 中收集图片链接：`generatedImageUrls`、`imageUrls` 数组及资源路径
#[must_use]
pub fn extract_image_urls(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for key in ["generatedImageUrls", "imageUrls", "imageURLs"] {
        if let Some(items) = value.get(key).and_then(Value::as_array) {
            for item in items.iter().filter_map(Value::as_str) {
                out.push(asset_to_url(item));
            }
        }
    }
    if let Some(card) = value.get("imageAttachmentInfo").and_then(|v| v.get("url")).and_then(Value::as_str) {
        out.push(asset_to_url(card));
    }
    out
}

/// 资源路径补全为 assets.grok.com 链接
#[must_use]
pub fn asset_to_url(raw: &str) -> String {
    let raw = raw.trim();
    let lower = raw.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || is_local_file_path(&lower) {
        return raw.to_string();
    }
    if is_likely_asset_path(raw) {
        return format!("https://assets.grok.com/{}", raw.trim_start_matches('/'));
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("/v1/files/image/abc.png", 1000)]
    #[case("http://127.0.0.1:3002/v1/files/image/abc.png", 980)]
    #[case("https://assets.grok.com/users/u/generated/x/image.jpg", 940)]
    #[case("https://assets.grok.com/users/u/generated/x-part-0/image.jpg", 820)]
    #[case("https://grok.com/pic.png", 700)]
    #[case("https://encrypted-tbn0.gstatic.com/a.jpg", 10)]
    #[case("https://example.com/a.png?thumb=1", 70)]
    #[case("https://example.com/page.html", -1)]
    #[case("", -1)]
    fn test_scores(#[case] url: &str, #[case] expected: i32) {
        assert_eq!(image_url_score(url), expected);
    }

    #[test]
    fn test_part_dropped_when_full_exists() {
        let urls = vec![
            "https://assets.grok.com/users/u/generated/a-part-0/image.jpg".to_string(),
            "https://assets.grok.com/users/u/generated/a/image.jpg".to_string(),
            "https://assets.grok.com/users/u/generated/b-part-0/image.jpg".to_string(),
            "https://example.com/x.png".to_string(),
        ];
        assert_eq!(
            normalize_image_urls(&urls, 0, false),
            vec![
                "https://assets.grok.com/users/u/generated/a/image.jpg".to_string(),
                "https://assets.grok.com/users/u/generated/b-part-0/image.jpg".to_string(),
                "https://example.com/x.png".to_string(),
            ]
        );
    }

    #[test]
    fn test_prefer_grok_drops_external_links_and_caps() {
        let urls = vec![
            "https://example.com/x.png".to_string(),
            "https://assets.grok.com/users/u/generated/b/image.jpg".to_string(),
            "https://assets.grok.com/users/u/generated/a/image.jpg".to_string(),
        ];
        assert_eq!(
            normalize_image_urls(&urls, 1, true),
            vec!["https://assets.grok.com/users/u/generated/a/image.jpg".to_string()]
        );
    }

    #[test]
    fn test_extract_from_json_and_text() {
        let value = serde_json::json!({
            "generatedImageUrls": ["users/u/generated/a/image.jpg", "https://grok.com/b.png"]
        });
        assert_eq!(
            extract_image_urls(&value),
            vec![
                "https://assets.grok.com/users/u/generated/a/image.jpg".to_string(),
                "https://grok.com/b.png".to_string(),
            ]
        );
        let text = "see https://a.com/1.png and (https://a.com/2.webp?x=1) https://a.com/1.png";
        assert_eq!(
            extract_image_urls_from_text(text),
            vec!["https://a.com/1.png".to_string(), "https://a.com/2.webp?x=1".to_string()]
        );
    }

    proptest! {
        #[test]
        fn prop_output_sorted_by_score_then_url(names in proptest::collection::vec("[a-c]{1,3}", 0..12), parts in proptest::collection::vec(any::<bool>(), 12)) {
            let urls: Vec<String> = names
                .iter()
                .zip(parts.iter())
                .map(|(n, part)| {
                    if *part {
                        format!("https://assets.grok.com/g/generated/{n}-part-0/image.png")
                    } else {
                        format!("https://example.com/{n}.png")
                    }
                })
                .collect();
            let out = select_image_urls(&urls, false);
            for pair in out.windows(2) {
                let (a, b) = (image_url_score(&pair[0]), image_url_score(&pair[1]));
                prop_assert!(a > b || (a == b && pair[0] < pair[1]));
            }
            let unique: HashSet<&String> = out.iter().collect();
            prop_assert_eq!(unique.len(), out.len());
        }
    }
}
