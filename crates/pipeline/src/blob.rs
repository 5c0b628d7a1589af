//! Blob storage for rendered images and thumbnails.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use image::imageops::FilterType;
use image::ImageFormat;

/// Longest edge of a generated thumbnail, in pixels.
pub const THUMBNAIL_EDGE: u32 = 256;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid blob path: {0}")]
    InvalidPath(String),

    #[error("Thumbnail generation failed: {0}")]
    Thumbnail(#[from] image::ImageError),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `path` and return the public URL.
    async fn save(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError>;
}

// ---------------------------------------------------------------------------
// LocalBlobStore
// ---------------------------------------------------------------------------

/// Writes blobs below a root directory and serves them from a public base URL.
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn save(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, BlobError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;

        tracing::debug!(path, content_type, size = bytes.len(), "Blob saved");
        Ok(format!("{}/{}", self.public_base_url, path))
    }
}

// ---------------------------------------------------------------------------
// Thumbnails
// ---------------------------------------------------------------------------

/// Downscale an encoded image to fit a [`THUMBNAIL_EDGE`] box and encode it
/// as PNG. Images already inside the box are re-encoded unscaled.
pub fn make_thumbnail(bytes: &[u8]) -> Result<Vec<u8>, BlobError> {
    let image = image::load_from_memory(bytes)?;
    let thumb = if image.width() > THUMBNAIL_EDGE || image.height() > THUMBNAIL_EDGE {
        image.resize(THUMBNAIL_EDGE, THUMBNAIL_EDGE, FilterType::Triangle)
    } else {
        image
    };

    let mut out = std::io::Cursor::new(Vec::new());
    thumb.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
