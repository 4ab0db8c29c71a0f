mod blob;
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures;

pub use blob::{is_blob_url, BlobStore, BLOB_SCHEME};

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{ImageBuffer, ImageFormat, Rgba};
use lopdf::Document;
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

const FILE_SCHEME: &str = "file://";
const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub page_index: u32,
    pub scale: f32,
    pub clip: Option<ClipRect>,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self { page_index: 0, scale: 1.0, clip: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailSize {
    pub width_px: u32,
    pub height_px: u32,
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        Self { width_px: 256, height_px: 256 }
    }
}

#[derive(Debug, Clone)]
pub enum OpenSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl OpenSource {
    /// Maps a record URL to the bytes it refers to.
    ///
    /// `blob:` URLs are looked up in `blobs`, `file://` URLs and bare paths go
    /// to the filesystem. Any other scheme is rejected.
    pub fn from_url(url: &str, blobs: &BlobStore) -> Result<Self, PdfEngineError> {
        if is_blob_url(url) {
            return blobs
                .resolve(url)
                .map(Self::Bytes)
                .ok_or_else(|| PdfEngineError::RevokedUrl(url.to_owned()));
        }

        if let Some(path) = url.strip_prefix(FILE_SCHEME) {
            return Ok(Self::Path(PathBuf::from(path)));
        }

        if url.is_empty() || url.contains("://") || url.starts_with("data:") {
            return Err(PdfEngineError::UnsupportedUrl(url.to_owned()));
        }

        Ok(Self::Path(PathBuf::from(url)))
    }
}

impl From<PathBuf> for OpenSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for OpenSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<Vec<u8>> for OpenSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PdfEngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("unsupported document URL: {0}")]
    UnsupportedUrl(String),
    #[error("object URL has been revoked: {0}")]
    RevokedUrl(String),
    #[error("image encoding error: {0}")]
    Encode(#[from] image::ImageError),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Opens documents by URL. Implementations block, so async callers should
/// run them on a blocking thread.
pub trait DocumentLoader: Send + Sync {
    fn open(&self, url: &str) -> Result<PdfDocument, PdfEngineError>;
}

struct DocumentInner {
    handle: DocumentHandle,
    bytes: Arc<[u8]>,
    page_sizes: Vec<PageSize>,
}

/// A parsed document. Cheap to clone; clones share the parsed state.
#[derive(Clone)]
pub struct PdfDocument {
    inner: Arc<DocumentInner>,
}

impl fmt::Debug for PdfDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfDocument")
            .field("handle", &self.inner.handle)
            .field("page_count", &self.page_count())
            .finish()
    }
}

impl PartialEq for PdfDocument {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl Eq for PdfDocument {}

impl PdfDocument {
    pub fn handle(&self) -> DocumentHandle {
        self.inner.handle
    }

    pub fn page_count(&self) -> u32 {
        self.inner.page_sizes.len() as u32
    }

    pub fn byte_len(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn page_size(&self, page_index: u32) -> Result<PageSize, PdfEngineError> {
        self.inner.page_sizes.get(page_index as usize).copied().ok_or(
            PdfEngineError::PageOutOfRange { page: page_index, page_count: self.page_count() },
        )
    }

    pub fn render_page(&self, request: RenderRequest) -> Result<RgbaImage, PdfEngineError> {
        let page_size = self.page_size(request.page_index)?;
        let scale = if request.scale <= 0.0 { 1.0 } else { request.scale };

        let mut width = (page_size.width_pt * scale).round().max(1.0) as u32;
        let mut height = (page_size.height_pt * scale).round().max(1.0) as u32;

        if let Some(clip) = request.clip {
            width = (clip.width * scale).round().max(1.0) as u32;
            height = (clip.height * scale).round().max(1.0) as u32;
        }

        let mut image = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));

        if width >= 4 && height >= 4 {
            let frame = Rgba([220, 220, 220, 255]);
            for x in 0..width {
                image.put_pixel(x, 0, frame);
                image.put_pixel(x, height - 1, frame);
            }
            for y in 0..height {
                image.put_pixel(0, y, frame);
                image.put_pixel(width - 1, y, frame);
            }
        }

        Ok(image)
    }

    pub fn render_thumbnail(
        &self,
        page_index: u32,
        target: ThumbnailSize,
    ) -> Result<RgbaImage, PdfEngineError> {
        let page = self.render_page(RenderRequest { page_index, scale: 0.25, clip: None })?;

        Ok(image::imageops::thumbnail(&page, target.width_px.max(1), target.height_px.max(1)))
    }

    /// Renders a page thumbnail and returns it as a PNG `data:` URL.
    pub fn render_preview(
        &self,
        page_index: u32,
        target: ThumbnailSize,
    ) -> Result<String, PdfEngineError> {
        let thumbnail = self.render_thumbnail(page_index, target)?;
        encode_png_data_url(&thumbnail)
    }
}

pub fn encode_png_data_url(image: &RgbaImage) -> Result<String, PdfEngineError> {
    let mut png_bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;

    Ok(format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(&png_bytes)))
}

/// Decodes a PNG `data:` URL produced by [`encode_png_data_url`].
#[cfg(any(test, feature = "test-support"))]
pub fn decode_png_data_url(url: &str) -> Result<RgbaImage, PdfEngineError> {
    let payload = url
        .strip_prefix(PNG_DATA_URL_PREFIX)
        .ok_or_else(|| PdfEngineError::UnsupportedUrl(url.chars().take(32).collect()))?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|err| PdfEngineError::Backend(format!("invalid base64 payload: {err}")))?;

    Ok(image::load_from_memory_with_format(&bytes, ImageFormat::Png)?.to_rgba8())
}

/// Default loader backed by `lopdf`.
#[derive(Debug, Default)]
pub struct LopdfEngine {
    next_handle: AtomicU64,
    blobs: BlobStore,
}

impl LopdfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob_store(blobs: BlobStore) -> Self {
        Self { next_handle: AtomicU64::new(0), blobs }
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn open_source(&self, source: OpenSource) -> Result<PdfDocument, PdfEngineError> {
        let bytes: Arc<[u8]> = match source {
            OpenSource::Path(path) => fs::read(path)?.into(),
            OpenSource::Bytes(bytes) => bytes,
        };

        let page_sizes = Self::parse_sizes(&bytes)?;
        let handle = DocumentHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);

        tracing::debug!(handle = handle.raw(), pages = page_sizes.len(), "opened document");

        Ok(PdfDocument { inner: Arc::new(DocumentInner { handle, bytes, page_sizes }) })
    }

    fn parse_sizes(bytes: &[u8]) -> Result<Vec<PageSize>, PdfEngineError> {
        if trailer_names_encryption(bytes) {
            return Err(PdfEngineError::EncryptedUnsupported);
        }

        let doc = Document::load_mem(bytes)?;
        if doc.trailer.get(b"Encrypt").is_ok() {
            return Err(PdfEngineError::EncryptedUnsupported);
        }
        let pages = doc.get_pages();
        let mut sizes = Vec::with_capacity(pages.len());

        for (_, object_id) in pages {
            let dict = doc.get_dictionary(object_id)?;
            let size = dict
                .get(b"MediaBox")
                .ok()
                .and_then(|obj| obj.as_array().ok())
                .and_then(|array| {
                    if array.len() != 4 {
                        return None;
                    }
                    let x0 = array[0].as_float().ok()?;
                    let y0 = array[1].as_float().ok()?;
                    let x1 = array[2].as_float().ok()?;
                    let y1 = array[3].as_float().ok()?;
                    Some(PageSize { width_pt: (x1 - x0).abs(), height_pt: (y1 - y0).abs() })
                })
                .unwrap_or(PageSize { width_pt: 612.0, height_pt: 792.0 });

            sizes.push(size);
        }

        if sizes.is_empty() {
            return Err(PdfEngineError::Backend("document has no pages".to_owned()));
        }

        Ok(sizes)
    }
}

/// Looks for `/Encrypt` in the trailer dictionary, or in the cross-reference
/// stream dictionary when the file has no classic trailer. Page content is
/// never scanned.
fn trailer_names_encryption(bytes: &[u8]) -> bool {
    let start = rfind(bytes, b"trailer").or_else(|| rfind(bytes, b"/XRef"));
    start.map(|at| &bytes[at..]).is_some_and(|tail| rfind(tail, b"/Encrypt").is_some())
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

impl DocumentLoader for LopdfEngine {
    fn open(&self, url: &str) -> Result<PdfDocument, PdfEngineError> {
        let source = OpenSource::from_url(url, &self.blobs)?;
        self.open_source(source)
    }
}

pub fn default_engine() -> LopdfEngine {
    LopdfEngine::new()
}
