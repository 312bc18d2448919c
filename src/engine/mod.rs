//! Native engine seam
//!
//! The native PDF engine is single threaded and keeps global state. Every
//! worker owns exactly one [`NativeEngine`], created on the worker's own
//! thread by an [`EngineFactory`], so engines never need to be `Send`.
//!
//! Objects live behind [`RawHandle`]s with manual lifetimes. The engine
//! trusts its caller: handing it a closed handle is undefined on the native
//! side, which is why the worker only ever passes handles it resolved
//! through its reference registry.
//!
//! # Backends
//!
//! - `mupdf` (feature `engine-mupdf`): MuPDF via the `mupdf` crate
//! - `testing` (tests only): scriptable in-memory engine

#[cfg(feature = "engine-mupdf")]
pub mod mupdf;
#[cfg(test)]
pub(crate) mod testing;

use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DispatchError, NativeErrorCode};
use crate::protocol::types::{
    AnnotationSubtype, BitmapFormat, BitmapInfo, Color, FlattenMode, FlattenResult, MetadataTag,
    PageSize, Permissions, PixelRect, Rect, RenderFlags, RenderStatus, Rotation, SaveMode,
    SearchFlags, SearchMatch, Viewport,
};

/// Opaque native handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// Failure reported by a native call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeFailure {
    /// Call failed and the engine set its last-error code
    #[error("native call failed: {0}")]
    LastError(NativeErrorCode),

    /// Backend does not implement the call
    #[error("not supported by this engine: {0}")]
    Unsupported(String),

    /// Engine is in an unrecoverable state
    #[error("fatal engine failure: {0}")]
    Fatal(String),
}

impl NativeFailure {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Convert into the caller-facing error for `operation`
    pub fn into_dispatch(self, operation: &str) -> DispatchError {
        match self {
            Self::LastError(code) => DispatchError::NativeCallFailed {
                operation: operation.to_string(),
                code,
            },
            Self::Unsupported(what) => DispatchError::UnsupportedOperation(what),
            Self::Fatal(reason) => DispatchError::WorkerUnavailable(reason),
        }
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeFailure>;

/// Source data for a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSource {
    /// Document held in memory
    Bytes(Arc<Vec<u8>>),
    /// Document read from a file path
    Path(PathBuf),
}

impl DocumentSource {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::Bytes(Arc::new(data))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    /// Document bytes, reading the file for path sources
    pub fn read(&self) -> std::io::Result<Arc<Vec<u8>>> {
        match self {
            Self::Bytes(data) => Ok(Arc::clone(data)),
            Self::Path(path) => std::fs::read(path).map(Arc::new),
        }
    }
}

/// One native engine instance
///
/// Calls map 1:1 onto the engine's C API. Implementations are only ever
/// called from the thread that created them, one call at a time.
pub trait NativeEngine {
    fn name(&self) -> &'static str;

    // Documents

    /// Open a document; `None` means no password was supplied at all
    fn load_document(
        &mut self,
        source: &DocumentSource,
        password: Option<&str>,
    ) -> NativeResult<RawHandle>;
    fn create_document(&mut self) -> NativeResult<RawHandle>;
    fn close_document(&mut self, document: RawHandle) -> NativeResult<()>;
    fn page_count(&mut self, document: RawHandle) -> NativeResult<usize>;
    /// File version as `major * 10 + minor`, if the header declares one
    fn file_version(&mut self, document: RawHandle) -> NativeResult<Option<u32>>;
    fn permissions(&mut self, document: RawHandle) -> NativeResult<Permissions>;
    fn metadata(&mut self, document: RawHandle, tag: MetadataTag) -> NativeResult<String>;
    fn save_copy(&mut self, document: RawHandle, mode: SaveMode) -> NativeResult<Vec<u8>>;

    // Pages

    fn load_page(&mut self, document: RawHandle, index: usize) -> NativeResult<RawHandle>;
    fn close_page(&mut self, page: RawHandle) -> NativeResult<()>;
    fn page_size(&mut self, page: RawHandle) -> NativeResult<PageSize>;
    fn page_rotation(&mut self, page: RawHandle) -> NativeResult<Rotation>;
    fn set_page_rotation(&mut self, page: RawHandle, rotation: Rotation) -> NativeResult<()>;
    fn flatten_page(&mut self, page: RawHandle, mode: FlattenMode) -> NativeResult<FlattenResult>;

    // Text

    fn load_text_page(&mut self, page: RawHandle) -> NativeResult<RawHandle>;
    fn close_text_page(&mut self, text_page: RawHandle) -> NativeResult<()>;
    fn char_count(&mut self, text_page: RawHandle) -> NativeResult<usize>;
    fn text_range(&mut self, text_page: RawHandle, start: usize, count: usize)
        -> NativeResult<String>;
    fn char_box(&mut self, text_page: RawHandle, index: usize) -> NativeResult<Rect>;

    // Search

    fn find_start(
        &mut self,
        text_page: RawHandle,
        query: &str,
        flags: SearchFlags,
        start_index: Option<usize>,
    ) -> NativeResult<RawHandle>;
    fn find_next(&mut self, search: RawHandle) -> NativeResult<bool>;
    fn find_prev(&mut self, search: RawHandle) -> NativeResult<bool>;
    fn find_result(&mut self, search: RawHandle) -> NativeResult<SearchMatch>;
    fn find_close(&mut self, search: RawHandle) -> NativeResult<()>;

    // Annotations

    fn annotation_count(&mut self, page: RawHandle) -> NativeResult<usize>;
    fn annotation(&mut self, page: RawHandle, index: usize) -> NativeResult<RawHandle>;
    fn annotation_subtype(&mut self, annotation: RawHandle) -> NativeResult<AnnotationSubtype>;
    fn annotation_rect(&mut self, annotation: RawHandle) -> NativeResult<Rect>;
    fn create_annotation(
        &mut self,
        page: RawHandle,
        subtype: AnnotationSubtype,
    ) -> NativeResult<RawHandle>;
    fn close_annotation(&mut self, annotation: RawHandle) -> NativeResult<()>;

    // Bookmarks

    /// First child of `parent`, or the first top-level entry
    fn bookmark_first_child(
        &mut self,
        document: RawHandle,
        parent: Option<RawHandle>,
    ) -> NativeResult<Option<RawHandle>>;
    fn bookmark_next_sibling(
        &mut self,
        document: RawHandle,
        bookmark: RawHandle,
    ) -> NativeResult<Option<RawHandle>>;
    fn bookmark_title(&mut self, bookmark: RawHandle) -> NativeResult<String>;
    fn bookmark_page(&mut self, document: RawHandle, bookmark: RawHandle)
        -> NativeResult<Option<usize>>;

    // Attachments

    fn attachment_count(&mut self, document: RawHandle) -> NativeResult<usize>;
    fn attachment(&mut self, document: RawHandle, index: usize) -> NativeResult<RawHandle>;
    fn attachment_name(&mut self, attachment: RawHandle) -> NativeResult<String>;
    fn attachment_file(&mut self, attachment: RawHandle) -> NativeResult<Vec<u8>>;

    // Bitmaps

    fn create_bitmap(
        &mut self,
        width: u32,
        height: u32,
        format: BitmapFormat,
    ) -> NativeResult<RawHandle>;
    fn fill_rect(&mut self, bitmap: RawHandle, rect: PixelRect, color: Color) -> NativeResult<()>;
    fn bitmap_info(&mut self, bitmap: RawHandle) -> NativeResult<BitmapInfo>;
    fn bitmap_buffer(&mut self, bitmap: RawHandle) -> NativeResult<Vec<u8>>;
    fn destroy_bitmap(&mut self, bitmap: RawHandle) -> NativeResult<()>;

    // Rendering

    fn render_page_bitmap(
        &mut self,
        bitmap: RawHandle,
        page: RawHandle,
        viewport: Viewport,
        rotation: Rotation,
        flags: RenderFlags,
    ) -> NativeResult<()>;

    /// Start a progressive render of `page`
    ///
    /// The engine calls `pause` between units of work and returns
    /// [`RenderStatus::ToBeContinued`] as soon as it answers `true`.
    fn render_start(
        &mut self,
        bitmap: RawHandle,
        page: RawHandle,
        viewport: Viewport,
        rotation: Rotation,
        flags: RenderFlags,
        pause: &mut dyn FnMut() -> bool,
    ) -> NativeResult<RenderStatus>;
    fn render_continue(
        &mut self,
        page: RawHandle,
        pause: &mut dyn FnMut() -> bool,
    ) -> NativeResult<RenderStatus>;
    /// Release the progressive render context of `page`
    fn render_close(&mut self, page: RawHandle) -> NativeResult<()>;
}

/// Start indices of `query` in `text`
///
/// Shared by backends that search their own extracted text.
pub(crate) fn text_matches(text: &[char], query: &str, flags: SearchFlags) -> Vec<usize> {
    let fold = |c: char| {
        if flags.match_case {
            c
        } else {
            c.to_lowercase().next().unwrap_or(c)
        }
    };
    let haystack: Vec<char> = text.iter().map(|c| fold(*c)).collect();
    let needle: Vec<char> = query.chars().map(fold).collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }

    let is_word = |i: Option<usize>| i.and_then(|i| haystack.get(i)).is_some_and(|c| c.is_alphanumeric());
    let mut matches = Vec::new();
    let mut at = 0;
    while at + needle.len() <= haystack.len() {
        if haystack[at..at + needle.len()] == needle[..]
            && !(flags.match_whole_word
                && (is_word(at.checked_sub(1)) || is_word(Some(at + needle.len()))))
        {
            matches.push(at);
            if flags.consecutive {
                at += 1;
            } else {
                at += needle.len();
            }
            continue;
        }
        at += 1;
    }
    matches
}

/// Creates engines on worker threads
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> NativeResult<Box<dyn NativeEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> NativeResult<Box<dyn NativeEngine>> + Send + Sync,
{
    fn create(&self) -> NativeResult<Box<dyn NativeEngine>> {
        self()
    }
}

/// Factory for the engine compiled into this build
pub fn default_factory() -> Arc<dyn EngineFactory> {
    #[cfg(feature = "engine-mupdf")]
    {
        Arc::new(|| -> NativeResult<Box<dyn NativeEngine>> {
            Ok(Box::new(mupdf::MupdfEngine::new()))
        })
    }
    #[cfg(not(feature = "engine-mupdf"))]
    {
        Arc::new(|| -> NativeResult<Box<dyn NativeEngine>> {
            Err(NativeFailure::Fatal(
                "no native engine compiled in, rebuild with --features engine-mupdf".to_string(),
            ))
        })
    }
}
