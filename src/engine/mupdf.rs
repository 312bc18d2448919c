//! MuPDF backend
//!
//! Implements [`NativeEngine`] on top of the `mupdf` crate. MuPDF's
//! `fz_context` is not thread-safe, which matches the worker model: the
//! engine is created on its worker thread and never leaves it.
//!
//! # Coverage
//!
//! The 0.5 bindings expose documents, pages, structured text, outlines and
//! pixmap rendering. Annotation, attachment and editing calls report
//! [`NativeFailure::Unsupported`].
//!
//! # Progressive rendering
//!
//! MuPDF has no pause callback. `render_start` rasterizes the page into a
//! pixmap once, then copies it into the target bitmap in horizontal bands,
//! consulting the pause predicate between bands.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use mupdf::{Colorspace, Document, Matrix, MetadataName, Outline, Page, Pixmap, TextPageOptions};

use super::{text_matches, DocumentSource, NativeEngine, NativeFailure, NativeResult, RawHandle};
use crate::error::NativeErrorCode;
use crate::protocol::types::{
    AnnotationSubtype, BitmapFormat, BitmapInfo, Color, FlattenMode, FlattenResult, MetadataTag,
    PageSize, Permissions, PixelRect, Rect, RenderFlags, RenderStatus, Rotation, SaveMode,
    SearchFlags, SearchMatch, Viewport,
};

/// Rows copied per progressive step
const BAND_ROWS: usize = 64;

const PDF_MIME: &str = "application/pdf";

struct DocumentState {
    doc: Document,
    bytes: Arc<Vec<u8>>,
    outlines: Option<Vec<Outline>>,
}

struct PageState {
    page: Page,
}

struct TextState {
    chars: Vec<(char, Rect)>,
}

struct SearchState {
    matches: Vec<usize>,
    count: usize,
    position: isize,
}

struct BitmapState {
    info: BitmapInfo,
    buffer: Vec<u8>,
}

struct RenderJob {
    bitmap: u64,
    pixmap: Pixmap,
    viewport: Viewport,
    next_row: usize,
}

enum Object {
    Document(DocumentState),
    Page(PageState),
    TextPage(TextState),
    Search(SearchState),
    Bookmark { document: u64, path: Vec<usize> },
    Bitmap(BitmapState),
}

/// MuPDF engine instance
pub struct MupdfEngine {
    next_handle: u64,
    objects: HashMap<u64, Object>,
    renders: HashMap<u64, RenderJob>,
}

fn last_error(code: NativeErrorCode) -> NativeFailure {
    NativeFailure::LastError(code)
}

fn unknown(err: mupdf::Error) -> NativeFailure {
    tracing::debug!(error = %err, "mupdf call failed");
    last_error(NativeErrorCode::Unknown)
}

/// Classify a failed open by MuPDF's message
fn open_error(err: mupdf::Error) -> NativeFailure {
    let message = err.to_string().to_lowercase();
    let code = if message.contains("password") {
        NativeErrorCode::Password
    } else if message.contains("cannot open") || message.contains("no such file") {
        NativeErrorCode::File
    } else if message.contains("encrypt") {
        NativeErrorCode::Security
    } else {
        NativeErrorCode::Format
    };
    tracing::debug!(error = %err, code = %code, "mupdf open failed");
    last_error(code)
}

fn metadata_name(tag: MetadataTag) -> MetadataName {
    match tag {
        MetadataTag::Title => MetadataName::Title,
        MetadataTag::Author => MetadataName::Author,
        MetadataTag::Subject => MetadataName::Subject,
        MetadataTag::Keywords => MetadataName::Keywords,
        MetadataTag::Creator => MetadataName::Creator,
        MetadataTag::Producer => MetadataName::Producer,
        MetadataTag::CreationDate => MetadataName::CreationDate,
        MetadataTag::ModDate => MetadataName::ModDate,
    }
}

/// "PDF 1.7" -> 17
fn parse_version(format: &str) -> Option<u32> {
    let version = format.trim().strip_prefix("PDF")?.trim();
    let (major, minor) = version.split_once('.')?;
    Some(major.parse::<u32>().ok()? * 10 + minor.parse::<u32>().ok()?)
}

fn outline_at<'a>(outlines: &'a [Outline], path: &[usize]) -> Option<&'a Outline> {
    let (first, rest) = path.split_first()?;
    let mut node = outlines.get(*first)?;
    for index in rest {
        node = node.down.get(*index)?;
    }
    Some(node)
}

impl MupdfEngine {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            objects: HashMap::new(),
            renders: HashMap::new(),
        }
    }

    fn insert(&mut self, object: Object) -> RawHandle {
        let raw = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(raw, object);
        RawHandle(NonZeroU64::MIN.saturating_add(raw - 1))
    }

    fn remove(&mut self, handle: RawHandle) -> NativeResult<Object> {
        self.objects
            .remove(&handle.get())
            .ok_or(last_error(NativeErrorCode::Unknown))
    }

    fn document(&mut self, handle: RawHandle) -> NativeResult<&mut DocumentState> {
        match self.objects.get_mut(&handle.get()) {
            Some(Object::Document(state)) => Ok(state),
            _ => Err(last_error(NativeErrorCode::Unknown)),
        }
    }

    fn page(&self, handle: RawHandle) -> NativeResult<&Page> {
        match self.objects.get(&handle.get()) {
            Some(Object::Page(state)) => Ok(&state.page),
            _ => Err(last_error(NativeErrorCode::Unknown)),
        }
    }

    fn text(&self, handle: RawHandle) -> NativeResult<&TextState> {
        match self.objects.get(&handle.get()) {
            Some(Object::TextPage(state)) => Ok(state),
            _ => Err(last_error(NativeErrorCode::Unknown)),
        }
    }

    fn search(&mut self, handle: RawHandle) -> NativeResult<&mut SearchState> {
        match self.objects.get_mut(&handle.get()) {
            Some(Object::Search(state)) => Ok(state),
            _ => Err(last_error(NativeErrorCode::Unknown)),
        }
    }

    fn bitmap(&mut self, handle: RawHandle) -> NativeResult<&mut BitmapState> {
        match self.objects.get_mut(&handle.get()) {
            Some(Object::Bitmap(state)) => Ok(state),
            _ => Err(last_error(NativeErrorCode::Unknown)),
        }
    }

    fn outlines(&mut self, document: RawHandle) -> NativeResult<&[Outline]> {
        let state = self.document(document)?;
        if state.outlines.is_none() {
            state.outlines = Some(state.doc.outlines().map_err(unknown)?);
        }
        Ok(state.outlines.as_deref().unwrap_or(&[]))
    }

    fn bookmark_path(&self, handle: RawHandle) -> NativeResult<(u64, Vec<usize>)> {
        match self.objects.get(&handle.get()) {
            Some(Object::Bookmark { document, path }) => Ok((*document, path.clone())),
            _ => Err(last_error(NativeErrorCode::Unknown)),
        }
    }

    fn bookmark_at(
        &mut self,
        document: RawHandle,
        path: Vec<usize>,
    ) -> NativeResult<Option<RawHandle>> {
        if outline_at(self.outlines(document)?, &path).is_none() {
            return Ok(None);
        }
        Ok(Some(self.insert(Object::Bookmark {
            document: document.get(),
            path,
        })))
    }

    fn outline(&mut self, bookmark: RawHandle) -> NativeResult<&Outline> {
        let (document, path) = self.bookmark_path(bookmark)?;
        let document = RawHandle::new(document).ok_or(last_error(NativeErrorCode::Unknown))?;
        outline_at(self.outlines(document)?, &path).ok_or(last_error(NativeErrorCode::Unknown))
    }

    /// Rasterize `page` to fit `viewport`
    fn rasterize(
        &self,
        page: RawHandle,
        viewport: Viewport,
        rotation: Rotation,
        flags: RenderFlags,
    ) -> NativeResult<Pixmap> {
        let page = self.page(page)?;
        let bounds = page.bounds().map_err(unknown)?;
        let (width, height) = match rotation {
            Rotation::Clockwise90 | Rotation::CounterClockwise90 => {
                (bounds.y1 - bounds.y0, bounds.x1 - bounds.x0)
            }
            _ => (bounds.x1 - bounds.x0, bounds.y1 - bounds.y0),
        };
        if width <= 0.0 || height <= 0.0 {
            return Err(last_error(NativeErrorCode::Page));
        }

        let mut matrix = Matrix::new_rotate(rotation.degrees() as f32);
        matrix.concat(Matrix::new_scale(
            viewport.size_x as f32 / width,
            viewport.size_y as f32 / height,
        ));

        let colorspace = if flags.grayscale {
            Colorspace::device_gray()
        } else {
            Colorspace::device_rgb()
        };
        page.to_pixmap(&matrix, &colorspace, false, flags.annotations)
            .map_err(unknown)
    }

    /// Copy up to `rows` pixmap rows into the job's bitmap
    fn copy_band(&mut self, page: RawHandle, rows: usize) -> NativeResult<RenderStatus> {
        let Some(job) = self.renders.get_mut(&page.get()) else {
            return Err(last_error(NativeErrorCode::Unknown));
        };
        let Some(Object::Bitmap(bitmap)) = self.objects.get_mut(&job.bitmap) else {
            return Err(last_error(NativeErrorCode::Unknown));
        };

        let pix_width = job.pixmap.width() as usize;
        let pix_height = job.pixmap.height() as usize;
        let n = job.pixmap.n() as usize;
        let samples = job.pixmap.samples();
        let info = bitmap.info;
        let bpp = info.format.bytes_per_pixel();

        let end = (job.next_row + rows).min(pix_height);
        for y in job.next_row..end {
            let target_y = job.viewport.start_y.saturating_add(y as i32);
            if target_y < 0 || target_y >= info.height as i32 {
                continue;
            }
            for x in 0..pix_width {
                let target_x = job.viewport.start_x.saturating_add(x as i32);
                if target_x < 0 || target_x >= info.width as i32 {
                    continue;
                }
                let src = (y * pix_width + x) * n;
                let (r, g, b) = if n >= 3 {
                    (samples[src], samples[src + 1], samples[src + 2])
                } else {
                    (samples[src], samples[src], samples[src])
                };
                let pixel = Color { r, g, b, a: 255 }.to_pixel(info.format);
                let at = target_y as usize * info.stride + target_x as usize * bpp;
                bitmap.buffer[at..at + bpp].copy_from_slice(&pixel);
            }
        }
        job.next_row = end;

        if job.next_row >= pix_height {
            Ok(RenderStatus::Done)
        } else {
            Ok(RenderStatus::ToBeContinued)
        }
    }

    fn run_bands(
        &mut self,
        page: RawHandle,
        pause: &mut dyn FnMut() -> bool,
    ) -> NativeResult<RenderStatus> {
        loop {
            if self.copy_band(page, BAND_ROWS)? == RenderStatus::Done {
                return Ok(RenderStatus::Done);
            }
            if pause() {
                return Ok(RenderStatus::ToBeContinued);
            }
        }
    }

    fn begin(
        &mut self,
        bitmap: RawHandle,
        page: RawHandle,
        viewport: Viewport,
        rotation: Rotation,
        flags: RenderFlags,
    ) -> NativeResult<()> {
        self.bitmap(bitmap)?;
        let pixmap = self.rasterize(page, viewport, rotation, flags)?;
        self.renders.insert(
            page.get(),
            RenderJob {
                bitmap: bitmap.get(),
                pixmap,
                viewport,
                next_row: 0,
            },
        );
        Ok(())
    }
}

impl Default for MupdfEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for MupdfEngine {
    fn name(&self) -> &'static str {
        "mupdf"
    }

    fn load_document(
        &mut self,
        source: &DocumentSource,
        password: Option<&str>,
    ) -> NativeResult<RawHandle> {
        let bytes = source
            .read()
            .map_err(|_| last_error(NativeErrorCode::File))?;
        let mut doc = Document::from_bytes(&bytes, PDF_MIME).map_err(open_error)?;

        if doc.needs_password().map_err(open_error)? {
            let Some(password) = password else {
                return Err(last_error(NativeErrorCode::Password));
            };
            if !doc.authenticate(password).map_err(open_error)? {
                return Err(last_error(NativeErrorCode::Password));
            }
        }

        Ok(self.insert(Object::Document(DocumentState {
            doc,
            bytes,
            outlines: None,
        })))
    }

    fn create_document(&mut self) -> NativeResult<RawHandle> {
        Err(NativeFailure::unsupported("creating documents"))
    }

    fn close_document(&mut self, document: RawHandle) -> NativeResult<()> {
        self.remove(document).map(|_| ())
    }

    fn page_count(&mut self, document: RawHandle) -> NativeResult<usize> {
        let count = self.document(document)?.doc.page_count().map_err(unknown)?;
        Ok(count.max(0) as usize)
    }

    fn file_version(&mut self, document: RawHandle) -> NativeResult<Option<u32>> {
        let format = self
            .document(document)?
            .doc
            .metadata(MetadataName::Format)
            .map_err(unknown)?;
        Ok(parse_version(&format))
    }

    fn permissions(&mut self, document: RawHandle) -> NativeResult<Permissions> {
        let state = self.document(document)?;
        if state.doc.needs_password().map_err(unknown)? {
            return Err(NativeFailure::unsupported(
                "permissions of encrypted documents",
            ));
        }
        Ok(Permissions::all())
    }

    fn metadata(&mut self, document: RawHandle, tag: MetadataTag) -> NativeResult<String> {
        self.document(document)?
            .doc
            .metadata(metadata_name(tag))
            .map_err(unknown)
    }

    fn save_copy(&mut self, document: RawHandle, mode: SaveMode) -> NativeResult<Vec<u8>> {
        match mode {
            SaveMode::Full => Ok(self.document(document)?.bytes.as_ref().clone()),
            other => Err(NativeFailure::unsupported(format!("save mode {other:?}"))),
        }
    }

    fn load_page(&mut self, document: RawHandle, index: usize) -> NativeResult<RawHandle> {
        let index = i32::try_from(index).map_err(|_| last_error(NativeErrorCode::Page))?;
        let page = self
            .document(document)?
            .doc
            .load_page(index)
            .map_err(|_| last_error(NativeErrorCode::Page))?;
        Ok(self.insert(Object::Page(PageState { page })))
    }

    fn close_page(&mut self, page: RawHandle) -> NativeResult<()> {
        self.renders.remove(&page.get());
        self.remove(page).map(|_| ())
    }

    fn page_size(&mut self, page: RawHandle) -> NativeResult<PageSize> {
        let bounds = self.page(page)?.bounds().map_err(unknown)?;
        Ok(PageSize {
            width: bounds.x1 - bounds.x0,
            height: bounds.y1 - bounds.y0,
        })
    }

    fn page_rotation(&mut self, _page: RawHandle) -> NativeResult<Rotation> {
        Err(NativeFailure::unsupported("reading page rotation"))
    }

    fn set_page_rotation(&mut self, _page: RawHandle, _rotation: Rotation) -> NativeResult<()> {
        Err(NativeFailure::unsupported("editing page rotation"))
    }

    fn flatten_page(&mut self, _page: RawHandle, _mode: FlattenMode) -> NativeResult<FlattenResult> {
        Err(NativeFailure::unsupported("flattening pages"))
    }

    fn load_text_page(&mut self, page: RawHandle) -> NativeResult<RawHandle> {
        let text_page = self
            .page(page)?
            .to_text_page(TextPageOptions::empty())
            .map_err(unknown)?;

        let mut chars = Vec::new();
        for block in text_page.blocks() {
            for line in block.lines() {
                for ch in line.chars() {
                    if let Some(c) = ch.char() {
                        let quad = ch.quad();
                        let left = quad.ul.x.min(quad.ll.x);
                        let top = quad.ul.y.min(quad.ur.y);
                        let right = quad.ur.x.max(quad.lr.x);
                        let bottom = quad.ll.y.max(quad.lr.y);
                        chars.push((c, Rect::new(left, top, right, bottom)));
                    }
                }
                chars.push(('\n', Rect::default()));
            }
        }

        Ok(self.insert(Object::TextPage(TextState { chars })))
    }

    fn close_text_page(&mut self, text_page: RawHandle) -> NativeResult<()> {
        self.remove(text_page).map(|_| ())
    }

    fn char_count(&mut self, text_page: RawHandle) -> NativeResult<usize> {
        Ok(self.text(text_page)?.chars.len())
    }

    fn text_range(
        &mut self,
        text_page: RawHandle,
        start: usize,
        count: usize,
    ) -> NativeResult<String> {
        Ok(self
            .text(text_page)?
            .chars
            .iter()
            .skip(start)
            .take(count)
            .map(|(c, _)| *c)
            .collect())
    }

    fn char_box(&mut self, text_page: RawHandle, index: usize) -> NativeResult<Rect> {
        self.text(text_page)?
            .chars
            .get(index)
            .map(|(_, rect)| *rect)
            .ok_or(last_error(NativeErrorCode::Unknown))
    }

    fn find_start(
        &mut self,
        text_page: RawHandle,
        query: &str,
        flags: SearchFlags,
        start_index: Option<usize>,
    ) -> NativeResult<RawHandle> {
        let text: Vec<char> = self.text(text_page)?.chars.iter().map(|(c, _)| *c).collect();
        let matches = text_matches(&text, query, flags);
        let start = start_index.unwrap_or(0);
        let first = matches
            .iter()
            .position(|m| *m >= start)
            .unwrap_or(matches.len());
        Ok(self.insert(Object::Search(SearchState {
            matches,
            count: query.chars().count(),
            position: first as isize - 1,
        })))
    }

    fn find_next(&mut self, search: RawHandle) -> NativeResult<bool> {
        let state = self.search(search)?;
        if state.position + 1 < state.matches.len() as isize {
            state.position += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn find_prev(&mut self, search: RawHandle) -> NativeResult<bool> {
        let state = self.search(search)?;
        if state.position > 0 {
            state.position -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn find_result(&mut self, search: RawHandle) -> NativeResult<SearchMatch> {
        let state = self.search(search)?;
        usize::try_from(state.position)
            .ok()
            .and_then(|p| state.matches.get(p))
            .map(|index| SearchMatch {
                char_index: *index,
                count: state.count,
            })
            .ok_or(last_error(NativeErrorCode::Unknown))
    }

    fn find_close(&mut self, search: RawHandle) -> NativeResult<()> {
        self.remove(search).map(|_| ())
    }

    fn annotation_count(&mut self, _page: RawHandle) -> NativeResult<usize> {
        Err(NativeFailure::unsupported("annotations"))
    }

    fn annotation(&mut self, _page: RawHandle, _index: usize) -> NativeResult<RawHandle> {
        Err(NativeFailure::unsupported("annotations"))
    }

    fn annotation_subtype(&mut self, _annotation: RawHandle) -> NativeResult<AnnotationSubtype> {
        Err(NativeFailure::unsupported("annotations"))
    }

    fn annotation_rect(&mut self, _annotation: RawHandle) -> NativeResult<Rect> {
        Err(NativeFailure::unsupported("annotations"))
    }

    fn create_annotation(
        &mut self,
        _page: RawHandle,
        _subtype: AnnotationSubtype,
    ) -> NativeResult<RawHandle> {
        Err(NativeFailure::unsupported("annotations"))
    }

    fn close_annotation(&mut self, _annotation: RawHandle) -> NativeResult<()> {
        Ok(())
    }

    fn bookmark_first_child(
        &mut self,
        document: RawHandle,
        parent: Option<RawHandle>,
    ) -> NativeResult<Option<RawHandle>> {
        let mut path = match parent {
            Some(parent) => self.bookmark_path(parent)?.1,
            None => Vec::new(),
        };
        path.push(0);
        self.bookmark_at(document, path)
    }

    fn bookmark_next_sibling(
        &mut self,
        document: RawHandle,
        bookmark: RawHandle,
    ) -> NativeResult<Option<RawHandle>> {
        let (_, mut path) = self.bookmark_path(bookmark)?;
        let Some(last) = path.last_mut() else {
            return Err(last_error(NativeErrorCode::Unknown));
        };
        *last += 1;
        self.bookmark_at(document, path)
    }

    fn bookmark_title(&mut self, bookmark: RawHandle) -> NativeResult<String> {
        Ok(self.outline(bookmark)?.title.clone())
    }

    fn bookmark_page(
        &mut self,
        _document: RawHandle,
        bookmark: RawHandle,
    ) -> NativeResult<Option<usize>> {
        Ok(self.outline(bookmark)?.page.map(|p| p as usize))
    }

    fn attachment_count(&mut self, _document: RawHandle) -> NativeResult<usize> {
        Err(NativeFailure::unsupported("attachments"))
    }

    fn attachment(&mut self, _document: RawHandle, _index: usize) -> NativeResult<RawHandle> {
        Err(NativeFailure::unsupported("attachments"))
    }

    fn attachment_name(&mut self, _attachment: RawHandle) -> NativeResult<String> {
        Err(NativeFailure::unsupported("attachments"))
    }

    fn attachment_file(&mut self, _attachment: RawHandle) -> NativeResult<Vec<u8>> {
        Err(NativeFailure::unsupported("attachments"))
    }

    fn create_bitmap(
        &mut self,
        width: u32,
        height: u32,
        format: BitmapFormat,
    ) -> NativeResult<RawHandle> {
        let info = BitmapInfo::checked(width, height, format)
            .ok_or(last_error(NativeErrorCode::Unknown))?;
        let buffer = vec![0; info.buffer_len()];
        Ok(self.insert(Object::Bitmap(BitmapState { info, buffer })))
    }

    fn fill_rect(&mut self, bitmap: RawHandle, rect: PixelRect, color: Color) -> NativeResult<()> {
        let state = self.bitmap(bitmap)?;
        let info = state.info;
        let pixel = color.to_pixel(info.format);
        let bpp = info.format.bytes_per_pixel();
        let (columns, rows) = rect.clip(info.width, info.height);
        for y in rows {
            for x in columns.clone() {
                let at = y * info.stride + x * bpp;
                state.buffer[at..at + bpp].copy_from_slice(&pixel);
            }
        }
        Ok(())
    }

    fn bitmap_info(&mut self, bitmap: RawHandle) -> NativeResult<BitmapInfo> {
        Ok(self.bitmap(bitmap)?.info)
    }

    fn bitmap_buffer(&mut self, bitmap: RawHandle) -> NativeResult<Vec<u8>> {
        Ok(self.bitmap(bitmap)?.buffer.clone())
    }

    fn destroy_bitmap(&mut self, bitmap: RawHandle) -> NativeResult<()> {
        self.renders.retain(|_, job| job.bitmap != bitmap.get());
        self.remove(bitmap).map(|_| ())
    }

    fn render_page_bitmap(
        &mut self,
        bitmap: RawHandle,
        page: RawHandle,
        viewport: Viewport,
        rotation: Rotation,
        flags: RenderFlags,
    ) -> NativeResult<()> {
        self.begin(bitmap, page, viewport, rotation, flags)?;
        let result = self.copy_band(page, usize::MAX);
        self.renders.remove(&page.get());
        result.map(|_| ())
    }

    fn render_start(
        &mut self,
        bitmap: RawHandle,
        page: RawHandle,
        viewport: Viewport,
        rotation: Rotation,
        flags: RenderFlags,
        pause: &mut dyn FnMut() -> bool,
    ) -> NativeResult<RenderStatus> {
        self.begin(bitmap, page, viewport, rotation, flags)?;
        self.run_bands(page, pause)
    }

    fn render_continue(
        &mut self,
        page: RawHandle,
        pause: &mut dyn FnMut() -> bool,
    ) -> NativeResult<RenderStatus> {
        self.run_bands(page, pause)
    }

    fn render_close(&mut self, page: RawHandle) -> NativeResult<()> {
        self.renders.remove(&page.get());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("PDF 1.7"), Some(17));
        assert_eq!(parse_version("PDF 2.0"), Some(20));
        assert_eq!(parse_version("EPUB"), None);
    }

    #[test]
    fn test_garbage_is_format_error() {
        let mut engine = MupdfEngine::new();
        let source = DocumentSource::from_bytes(b"not a pdf".to_vec());
        assert!(matches!(
            engine.load_document(&source, None),
            Err(NativeFailure::LastError(_))
        ));
    }

    #[test]
    fn test_editing_is_unsupported() {
        let mut engine = MupdfEngine::new();
        assert!(matches!(
            engine.create_document(),
            Err(NativeFailure::Unsupported(_))
        ));
    }
}
