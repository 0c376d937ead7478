//! Local image storage for uploads.
//!
//! Files land at `<upload_dir>/<uid>/<id>.<ext>` and are served back under
//! `/uploads/`. The image type is decided by sniffing magic bytes. A
//! declared content type that disagrees with the bytes is rejected;
//! `application/octet-stream` counts as undeclared.

use std::path::{Path, PathBuf};

use campus_sdk::models::UploadResponse;

use crate::error::{ApiError, ApiResult};
use crate::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageKind {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageKind::Jpeg)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageKind::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageKind::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageKind::Webp)
        } else {
            None
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Png => "image/png",
            ImageKind::Gif => "image/gif",
            ImageKind::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Gif => "gif",
            ImageKind::Webp => "webp",
        }
    }
}

/// Media type without parameters, lowercased.
fn declared_mime(content_type: &str) -> String {
    content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
    public_url: String,
    max_bytes: usize,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>, public_url: &str, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Validate and persist one image owned by `uid`.
    pub async fn save(&self, uid: &str, bytes: &[u8], declared_type: Option<&str>) -> ApiResult<UploadResponse> {
        if bytes.is_empty() {
            return Err(ApiError::bad_request("empty file"));
        }
        if bytes.len() > self.max_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                "file too large (max {} bytes)",
                self.max_bytes
            )));
        }
        if uid.is_empty() || !uid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ApiError::bad_request("invalid owner id"));
        }
        let kind = ImageKind::sniff(bytes)
            .ok_or_else(|| ApiError::bad_request("unsupported file type (jpeg, png, gif, webp only)"))?;
        let declared = declared_type
            .map(declared_mime)
            .filter(|d| !d.is_empty() && d != "application/octet-stream");
        if let Some(declared) = declared {
            if declared != kind.mime() && !(kind == ImageKind::Jpeg && declared == "image/jpg") {
                tracing::debug!(%declared, detected = kind.mime(), "Upload content type mismatch");
                return Err(ApiError::bad_request(format!(
                    "declared type {declared} does not match file contents ({})",
                    kind.mime()
                )));
            }
        }

        let dir = self.root.join(uid);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ApiError::Internal(format!("creating {}: {e}", dir.display())))?;

        let file_name = format!("{}.{}", ids::generate().to_lowercase(), kind.extension());
        let full = dir.join(&file_name);
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("writing {}: {e}", full.display())))?;

        let rel = format!("{uid}/{file_name}");
        tracing::info!(uid, path = %rel, size = bytes.len(), "Stored upload");
        Ok(UploadResponse {
            url: format!("{}/uploads/{rel}", self.public_url),
            content_type: kind.mime().to_string(),
            size: bytes.len() as u64,
            path: rel,
        })
    }
}
