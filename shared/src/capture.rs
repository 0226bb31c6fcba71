//! Capture boundary.
//!
//! The camera and gallery live in the shell. The core only receives an opaque
//! [`ImageSource`] and resolves it into encoded bytes through an [`ImageLoader`].
//! Live mode pulls frames through a [`FrameSource`].

use std::path::PathBuf;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

pub const MAX_IMAGE_SIZE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    Jpeg,
    Png,
    WebP,
    Heic,
}

impl ImageFormat {
    /// HEIC is recognised so it can be rejected with a clear error; the
    /// decoder has no codec for it.
    pub fn is_decodable(&self) -> bool {
        !matches!(self, ImageFormat::Heic)
    }

    pub fn to_image_format(self) -> Option<image::ImageFormat> {
        match self {
            ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
            ImageFormat::Png => Some(image::ImageFormat::Png),
            ImageFormat::WebP => Some(image::ImageFormat::WebP),
            ImageFormat::Heic => None,
        }
    }

    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageFormat::Jpeg);
        }

        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(ImageFormat::Png);
        }

        if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(ImageFormat::WebP);
        }

        if &data[4..8] == b"ftyp" {
            let brand = &data[8..12];
            if brand == b"heic" || brand == b"heix" || brand == b"mif1" {
                return Some(ImageFormat::Heic);
            }
        }

        None
    }
}

/// Opaque reference handed over by the capture or gallery collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Encoded image bytes already in memory.
    Bytes(Bytes),
    /// Local file path.
    Path(PathBuf),
    /// `file://` or `data:image/...;base64,` URI.
    Uri(String),
}

impl ImageSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageSource::Bytes(_) => "bytes",
            ImageSource::Path(_) => "path",
            ImageSource::Uri(_) => "uri",
        }
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(data: Vec<u8>) -> Self {
        ImageSource::Bytes(Bytes::from(data))
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("image source is empty")]
    Empty,

    #[error("image too large: {size} bytes exceeds maximum of {max} bytes")]
    ImageTooLarge { size: usize, max: usize },

    #[error("unsupported uri: {reason}")]
    UnsupportedUri { reason: String },

    #[error("failed to read image: {reason}")]
    Read { reason: String },

    #[error("capture failed: {reason}")]
    CaptureFailed { reason: String },

    #[error("camera unavailable")]
    Unavailable,
}

impl CaptureError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::CaptureFailed { .. } | CaptureError::Unavailable
        )
    }
}

/// Resolves an [`ImageSource`] into encoded image bytes.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, source: &ImageSource) -> Result<Bytes, CaptureError>;
}

/// Produces frames for live mode, one per call.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture_frame(&self) -> Result<ImageSource, CaptureError>;
}

/// Loader for sources reachable without the network: memory, files and data URIs.
#[derive(Debug, Clone)]
pub struct LocalImageLoader {
    max_bytes: usize,
}

impl Default for LocalImageLoader {
    fn default() -> Self {
        Self {
            max_bytes: MAX_IMAGE_SIZE_BYTES,
        }
    }
}

impl LocalImageLoader {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
        }
    }

    fn check_size(&self, data: Bytes) -> Result<Bytes, CaptureError> {
        if data.is_empty() {
            return Err(CaptureError::Empty);
        }
        if data.len() > self.max_bytes {
            return Err(CaptureError::ImageTooLarge {
                size: data.len(),
                max: self.max_bytes,
            });
        }
        Ok(data)
    }

    async fn read_path(&self, path: PathBuf) -> Result<Bytes, CaptureError> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| CaptureError::Read {
                reason: e.to_string(),
            })?;
        if metadata.len() > self.max_bytes as u64 {
            return Err(CaptureError::ImageTooLarge {
                size: metadata.len() as usize,
                max: self.max_bytes,
            });
        }
        let data = tokio::fs::read(&path).await.map_err(|e| CaptureError::Read {
            reason: e.to_string(),
        })?;
        self.check_size(Bytes::from(data))
    }
}

#[async_trait]
impl ImageLoader for LocalImageLoader {
    #[instrument(skip(self, source), fields(kind = source.kind()))]
    async fn load(&self, source: &ImageSource) -> Result<Bytes, CaptureError> {
        match source {
            ImageSource::Bytes(data) => self.check_size(data.clone()),
            ImageSource::Path(path) => self.read_path(path.clone()).await,
            ImageSource::Uri(uri) => {
                if uri.starts_with("data:") {
                    let data = decode_data_uri(uri)?;
                    debug!(len = data.len(), "decoded data uri");
                    return self.check_size(Bytes::from(data));
                }

                let parsed = Url::parse(uri).map_err(|e| CaptureError::UnsupportedUri {
                    reason: e.to_string(),
                })?;
                if parsed.scheme() != "file" {
                    return Err(CaptureError::UnsupportedUri {
                        reason: format!("scheme '{}' is not readable locally", parsed.scheme()),
                    });
                }
                let path = parsed
                    .to_file_path()
                    .map_err(|_| CaptureError::UnsupportedUri {
                        reason: "file uri has no local path".to_string(),
                    })?;
                self.read_path(path).await
            }
        }
    }
}

/// Decodes `data:image/<subtype>;base64,<payload>`.
fn decode_data_uri(uri: &str) -> Result<Vec<u8>, CaptureError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| CaptureError::UnsupportedUri {
            reason: "missing data: prefix".to_string(),
        })?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| CaptureError::UnsupportedUri {
            reason: "data uri has no payload".to_string(),
        })?;

    if !header.starts_with("image/") || !header.ends_with(";base64") {
        return Err(CaptureError::UnsupportedUri {
            reason: format!("expected base64 image data uri, got '{header}'"),
        });
    }

    BASE64
        .decode(payload.trim())
        .map_err(|e| CaptureError::UnsupportedUri {
            reason: e.to_string(),
        })
}
