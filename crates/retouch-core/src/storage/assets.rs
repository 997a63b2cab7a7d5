//! Image ingress: fetching encoded sources and accepting uploads.

use super::{BoxFuture, ImageSource, UploadError, UploadService, UploadedImage};
use crate::config::{DEFAULT_MAX_SOURCE_BYTES, DEFAULT_THUMBNAIL_SIZE};
use crate::raster::{LoadError, SourceFormat, fit_within};
use image::ImageFormat;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory asset store keyed by URL. Serves as both an [`ImageSource`]
/// and an [`UploadService`].
pub struct MemoryAssets {
    files: RwLock<HashMap<String, Vec<u8>>>,
    max_bytes: usize,
    thumbnail_size: u32,
}

impl Default for MemoryAssets {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            max_bytes: DEFAULT_MAX_SOURCE_BYTES,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
        }
    }

    /// Override the upload size limit.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Store bytes under `url`.
    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(url.into(), bytes);
        }
    }

    /// Bytes stored under `url`.
    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.files.read().ok().and_then(|files| files.get(url).cloned())
    }

    /// Number of stored files.
    pub fn len(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn accept(&self, file_name: &str, bytes: Vec<u8>) -> Result<UploadedImage, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Rejected(format!("{} is empty", file_name)));
        }
        if bytes.len() > self.max_bytes {
            return Err(UploadError::Rejected(format!(
                "{} is {} bytes, limit is {}",
                file_name,
                bytes.len(),
                self.max_bytes
            )));
        }
        let format = SourceFormat::from_magic_bytes(&bytes)
            .ok_or_else(|| UploadError::Rejected(format!("{} is not a PNG, JPEG, WebP or GIF image", file_name)))?;
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| UploadError::Rejected(format!("{}: {}", file_name, e)))?;

        let (width, height) = (decoded.width(), decoded.height());
        let (tw, th) = fit_within(width, height, self.thumbnail_size);
        let mut thumb = Vec::new();
        decoded
            .thumbnail(tw, th)
            .write_to(&mut Cursor::new(&mut thumb), ImageFormat::Png)
            .map_err(|e| UploadError::Io(e.to_string()))?;

        let key = Uuid::new_v4();
        let url = format!("mem://uploads/{}/{}", key, file_name);
        let thumbnail_url = format!("mem://uploads/{}/thumb.png", key);
        self.insert(url.clone(), bytes);
        self.insert(thumbnail_url.clone(), thumb);
        log::debug!("Stored {} ({}, {}x{})", url, format.mime_type(), width, height);

        Ok(UploadedImage {
            url,
            thumbnail_url,
            width,
            height,
        })
    }
}

impl ImageSource for MemoryAssets {
    fn fetch(&self, url: &str) -> BoxFuture<'_, Result<Vec<u8>, LoadError>> {
        let url = url.to_string();
        Box::pin(async move {
            self.get(&url).ok_or_else(|| LoadError::Fetch {
                message: "no such asset".to_string(),
                url,
            })
        })
    }
}

impl UploadService for MemoryAssets {
    fn upload(&self, file_name: &str, bytes: Vec<u8>) -> BoxFuture<'_, Result<UploadedImage, UploadError>> {
        let file_name = file_name.to_string();
        Box::pin(async move { self.accept(&file_name, bytes) })
    }
}

/// Reads sources from the local filesystem. Accepts `file://` URLs and
/// paths relative to `root`.
pub struct FileImageSource {
    root: PathBuf,
}

impl FileImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        match url.strip_prefix("file://") {
            Some(path) => PathBuf::from(path),
            None => self.root.join(url),
        }
    }
}

impl ImageSource for FileImageSource {
    fn fetch(&self, url: &str) -> BoxFuture<'_, Result<Vec<u8>, LoadError>> {
        let url = url.to_string();
        Box::pin(async move {
            let path = self.resolve(&url);
            std::fs::read(&path).map_err(|e| LoadError::Fetch {
                message: e.to_string(),
                url,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{block_on, encode_png, solid};

    #[test]
    fn test_upload_returns_dimensions_and_thumbnail() {
        let assets = MemoryAssets::new();
        let png = encode_png(&solid(600, 300, [1, 2, 3, 255]));
        let uploaded = block_on(assets.upload("beach.png", png.clone())).unwrap();

        assert_eq!((uploaded.width, uploaded.height), (600, 300));
        assert!(uploaded.url.ends_with("/beach.png"));
        assert_eq!(block_on(assets.fetch(&uploaded.url)).unwrap(), png);

        let thumb = image::load_from_memory(&assets.get(&uploaded.thumbnail_url).unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (300, 150));
    }

    #[test]
    fn test_upload_rejects_bad_files() {
        let assets = MemoryAssets::new().with_max_bytes(64);
        assert!(matches!(
            block_on(assets.upload("empty.png", Vec::new())),
            Err(UploadError::Rejected(_))
        ));
        assert!(matches!(
            block_on(assets.upload("notes.txt", b"plain text".to_vec())),
            Err(UploadError::Rejected(_))
        ));
        let big = encode_png(&crate::test_util::gradient(64, 64));
        assert!(matches!(block_on(assets.upload("big.png", big)), Err(UploadError::Rejected(_))));
        assert!(assets.is_empty());
    }

    #[test]
    fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let png = encode_png(&solid(2, 2, [0, 0, 0, 255]));
        std::fs::write(dir.path().join("a.png"), &png).unwrap();

        let source = FileImageSource::new(dir.path());
        assert_eq!(block_on(source.fetch("a.png")).unwrap(), png);

        let absolute = format!("file://{}", dir.path().join("a.png").display());
        assert_eq!(block_on(source.fetch(&absolute)).unwrap(), png);

        assert!(matches!(block_on(source.fetch("missing.png")), Err(LoadError::Fetch { .. })));
    }
}
