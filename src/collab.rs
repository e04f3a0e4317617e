//! External collaborators of a worker: where input bytes come from, how an
//! image becomes a caption, and how a caption becomes a vector.
//!
//! The fleet only relies on the traits. The reference implementations are
//! deliberately small and deterministic so a node can run end to end without
//! any model service.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{FleetError, Result};

/// Resolves a task's resource path to raw bytes.
#[async_trait]
pub trait SourceFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, resource_path: &str) -> Result<Vec<u8>>;
}

/// Turns input bytes into a text caption.
#[async_trait]
pub trait Captioner: Send + Sync + std::fmt::Debug {
    async fn caption(&self, bytes: &[u8]) -> Result<String>;
}

/// Turns text into a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Reads resource paths relative to a data root on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map `resource_path` under the root, refusing anything that could
    /// escape it.
    pub fn resolve(&self, resource_path: &str) -> Result<PathBuf> {
        let relative = Path::new(resource_path);
        if resource_path.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(FleetError::InvalidResourcePath(resource_path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SourceFetcher for LocalFiles {
    async fn fetch(&self, resource_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(resource_path)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| FleetError::Collaborator(format!("cannot read {resource_path}: {e}")))
    }
}

/// Describes an image from its header: format, pixel size when the format
/// carries it cheaply, and byte size.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderCaptioner;

impl HeaderCaptioner {
    fn describe(bytes: &[u8]) -> Option<(&'static str, Option<(u32, u32)>)> {
        const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";

        if bytes.starts_with(PNG) {
            // IHDR is always the first chunk: width and height, big endian.
            let dims = bytes.get(16..24).map(|d| {
                (
                    u32::from_be_bytes([d[0], d[1], d[2], d[3]]),
                    u32::from_be_bytes([d[4], d[5], d[6], d[7]]),
                )
            });
            return Some(("PNG", dims));
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            let dims = bytes.get(6..10).map(|d| {
                (
                    u16::from_le_bytes([d[0], d[1]]) as u32,
                    u16::from_le_bytes([d[2], d[3]]) as u32,
                )
            });
            return Some(("GIF", dims));
        }
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(("JPEG", None));
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(("WebP", None));
        }
        if bytes.starts_with(b"BM") {
            return Some(("BMP", None));
        }
        None
    }
}

impl HeaderCaptioner {
    /// MIME type of an image recognised from its header.
    pub fn media_type(bytes: &[u8]) -> &'static str {
        match Self::describe(bytes) {
            Some(("PNG", _)) => "image/png",
            Some(("GIF", _)) => "image/gif",
            Some(("JPEG", _)) => "image/jpeg",
            Some(("WebP", _)) => "image/webp",
            Some(("BMP", _)) => "image/bmp",
            _ => "application/octet-stream",
        }
    }
}

#[async_trait]
impl Captioner for HeaderCaptioner {
    async fn caption(&self, bytes: &[u8]) -> Result<String> {
        let (format, dims) = Self::describe(bytes)
            .ok_or_else(|| FleetError::Collaborator("unrecognised image format".to_string()))?;

        let kib = bytes.len() as f64 / 1024.0;
        Ok(match dims {
            Some((w, h)) => format!("a {format} image of {w}x{h} pixels ({kib:.1} KiB)"),
            None => format!("a {format} image ({kib:.1} KiB)"),
        })
    }
}

/// Bag-of-words feature hashing into `dimension` buckets, L2-normalised.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    // FNV-1a, stable across builds and platforms.
    fn hash(token: &str) -> u64 {
        token.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimension == 0 {
            return Err(FleetError::InvalidConfig(
                "embedding dimension must be non-zero".to_string(),
            ));
        }

        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = Self::hash(&token.to_lowercase());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_escapes() {
        let files = LocalFiles::new("/data");
        assert_eq!(files.resolve("a/b.png").unwrap(), PathBuf::from("/data/a/b.png"));
        for bad in ["", "../etc/passwd", "a/../../b", "/etc/passwd"] {
            assert!(
                matches!(files.resolve(bad), Err(FleetError::InvalidResourcePath(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[tokio::test]
    async fn fetch_reads_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.bin"), b"hello").unwrap();
        let files = LocalFiles::new(dir.path());
        assert_eq!(files.fetch("x.bin").await.unwrap(), b"hello");
        assert!(matches!(
            files.fetch("missing.bin").await,
            Err(FleetError::Collaborator(_))
        ));
    }

    #[tokio::test]
    async fn png_caption_carries_dimensions() {
        let mut png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        let caption = HeaderCaptioner.caption(&png).await.unwrap();
        assert!(caption.starts_with("a PNG image of 640x480 pixels"), "{caption}");
    }

    #[test]
    fn media_type_follows_header() {
        assert_eq!(HeaderCaptioner::media_type(b"GIF89a\x01\x00\x01\x00"), "image/gif");
        assert_eq!(HeaderCaptioner::media_type(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(HeaderCaptioner::media_type(b"hello"), "application/octet-stream");
    }

    #[tokio::test]
    async fn unknown_bytes_fail_captioning() {
        assert!(HeaderCaptioner.caption(b"plain text").await.is_err());
        assert!(HeaderCaptioner.caption(&[]).await.is_err());
    }

    #[tokio::test]
    async fn embeddings_are_normalised_and_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("A red bicycle").await.unwrap();
        let b = embedder.embed("a RED bicycle!").await.unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let empty = embedder.embed("").await.unwrap();
        assert!(empty.iter().all(|v| *v == 0.0));
    }
}
