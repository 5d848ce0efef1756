//! # 媒体文件缓存
//!
//! 上游图片/视频下载后落盘到 `{data_dir}/tmp/{image|video}/`，文件名为
//! URL 摘要加扩展名，经 `/v1/files/{type}/{name}` 对外提供。

use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{ProxyError, Result};
use crate::utils::{random_hex, sha256_hex};

use super::HandlerState;

/// 文件名摘要长度（十六进制字符）
const DIGEST_LEN: usize = 40;

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    const fn default_ext(self) -> &'static str {
        match self {
            Self::Image => ".jpg",
            Self::Video => ".mp4",
        }
    }

    const fn default_mime(self) -> &'static str {
        match self {
            Self::Image => "image/jpeg",
            Self::Video => "video/mp4",
        }
    }
}

/// 清洗文件名：路径分隔符替换为 `-`，含 `..` 或为空时拒绝
#[must_use]
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.trim().replace(['\\', '/'], "-");
    let name = name.trim();
    if name.is_empty() || name.contains("..") {
        return None;
    }
    Some(name.to_string())
}

fn ext_from_mime(mime: &str) -> Option<&'static str> {
    let mime = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    Some(match mime.as_str() {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        _ => return None,
    })
}

/// 扩展名：优先 content-type，其次 URL 路径，最后按媒体类型兜底
#[must_use]
pub fn media_ext(media: MediaType, mime: &str, url: &str) -> String {
    if let Some(ext) = ext_from_mime(mime) {
        return ext.to_string();
    }
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    if let Some((_, ext)) = last.rsplit_once('.') {
        let ext = ext.to_ascii_lowercase();
        if !ext.is_empty() && ext.len() <= 9 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return format!(".{ext}");
        }
    }
    media.default_ext().to_string()
}

/// 按扩展名推断 content-type
#[must_use]
pub fn mime_for(media: MediaType, name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => media.default_mime(),
    }
}

/// 缓存目录统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirStats {
    pub count: u64,
    pub size_bytes: u64,
}

/// 媒体文件缓存
#[derive(Debug, Clone)]
pub struct FileCache {
    base: PathBuf,
}

impl FileCache {
    /// `base` 为 `{data_dir}/tmp`
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    #[must_use]
    pub fn from_data_dir(data_dir: &str) -> Self {
        Self::new(Path::new(data_dir).join("tmp"))
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn dir(&self, media: MediaType) -> PathBuf {
        self.base.join(media.as_str())
    }

    /// URL 对应的缓存文件名
    #[must_use]
    pub fn file_name(media: MediaType, url: &str, mime: &str) -> String {
        let digest = sha256_hex(url.trim().as_bytes());
        format!("{}{}", &digest[..DIGEST_LEN], media_ext(media, mime, url))
    }

    /// 写入缓存并返回文件名；已存在且非空时直接复用
    pub async fn store(&self, media: MediaType, url: &str, data: &[u8], mime: &str) -> Result<String> {
        if data.is_empty() {
            return Err(ProxyError::validation("empty media data"));
        }
        let dir = self.dir(media);
        tokio::fs::create_dir_all(&dir).await?;
        let name = Self::file_name(media, url, mime);
        let full = dir.join(&name);
        if let Ok(meta) = tokio::fs::metadata(&full).await {
            if meta.is_file() && meta.len() > 0 {
                return Ok(name);
            }
        }
        // 先写临时文件再改名，读者不会看到半截文件
        let tmp = dir.join(format!("{name}.tmp-{}", random_hex(4)));
        if let Err(e) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &full).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(name)
    }

    /// 读取缓存文件；不存在返回 `NotFound`
    pub async fn read(&self, media: MediaType, raw_name: &str) -> Result<(Vec<u8>, &'static str)> {
        let name = sanitize_file_name(raw_name).ok_or_else(|| ProxyError::not_found("file not found"))?;
        let full = self.dir(media).join(&name);
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(ProxyError::not_found("file not found")),
        }
        let bytes = tokio::fs::read(&full).await?;
        Ok((bytes, mime_for(media, &name)))
    }

    pub async fn stats(&self, media: MediaType) -> Result<DirStats> {
        let mut stats = DirStats::default();
        let mut entries = match tokio::fs::read_dir(self.dir(media)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                stats.count += 1;
                stats.size_bytes += meta.len();
            }
        }
        Ok(stats)
    }

    /// 清空某类缓存，返回被删除的统计
    pub async fn clear(&self, media: MediaType) -> Result<DirStats> {
        let stats = self.stats(media).await?;
        let dir = self.dir(media);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(stats)
    }

    /// 删除单个文件；不存在时返回 `false`
    pub async fn delete(&self, media: MediaType, raw_name: &str) -> Result<bool> {
        let name = sanitize_file_name(raw_name).ok_or_else(|| ProxyError::validation("invalid file name"))?;
        match tokio::fs::remove_file(self.dir(media).join(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// `GET /v1/files/{media_type}/{name}`
pub async fn serve_file(
    State(state): State<HandlerState>,
    UrlPath((media, name)): UrlPath<(String, String)>,
) -> Result<Response> {
    let media = MediaType::parse(&media).ok_or_else(|| ProxyError::not_found("file not found"))?;
    let (bytes, mime) = state.files.read(media, &name).await?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
        ],
        Body::from(bytes),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("abc.jpg", Some("abc.jpg"))]
    #[case(" a/b\\c.png ", Some("a-b-c.png"))]
    #[case("../etc/passwd", None)]
    #[case("   ", None)]
    fn test_sanitize(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(sanitize_file_name(raw).as_deref(), expected);
    }

    #[rstest]
    #[case(MediaType::Image, "image/png", "https://x/y.jpg", ".png")]
    #[case(MediaType::Image, "", "https://x/y.webp?sig=1", ".webp")]
    #[case(MediaType::Image, "application/octet-stream", "https://x/y", ".jpg")]
    #[case(MediaType::Video, "", "https://x/clip", ".mp4")]
    fn test_media_ext(#[case] media: MediaType, #[case] mime: &str, #[case] url: &str, #[case] ext: &str) {
        assert_eq!(media_ext(media, mime, url), ext);
    }

    #[tokio::test]
    async fn test_store_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let url = "https://assets.grok.com/users/u/generated/a/image.png";
        let name = cache.store(MediaType::Image, url, b"png-bytes", "image/png").await.unwrap();
        assert_eq!(name.len(), DIGEST_LEN + 4);
        assert!(name.ends_with(".png"));
        // 同一 URL 复用文件名
        assert_eq!(cache.store(MediaType::Image, url, b"other", "image/png").await.unwrap(), name);

        let (bytes, mime) = cache.read(MediaType::Image, &name).await.unwrap();
        assert_eq!(bytes, b"png-bytes");
        assert_eq!(mime, "image/png");
        assert!(matches!(
            cache.read(MediaType::Image, "../secret").await,
            Err(ProxyError::NotFound { .. })
        ));

        assert_eq!(cache.stats(MediaType::Image).await.unwrap().count, 1);
        let cleared = cache.clear(MediaType::Image).await.unwrap();
        assert_eq!(cleared.size_bytes, 9);
        assert_eq!(cache.stats(MediaType::Image).await.unwrap().count, 0);
        assert!(!cache.delete(MediaType::Image, &name).await.unwrap());
    }
}
