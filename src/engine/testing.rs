//! Scriptable in-memory engine for tests
//!
//! Documents are JSON [`Fixture`]s. A shared [`FakeControl`] lets a test
//! slow calls down, record when each call ran on which engine, and inject
//! failures or panics into the next call.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{DocumentSource, EngineFactory, NativeEngine, NativeFailure, NativeResult, RawHandle};
use crate::error::NativeErrorCode;
use crate::protocol::types::{
    AnnotationSubtype, BitmapFormat, BitmapInfo, Color, FlattenMode, FlattenResult, MetadataTag,
    PageSize, Permissions, PixelRect, Rect, RenderFlags, RenderStatus, Rotation, SaveMode,
    SearchFlags, SearchMatch, Viewport,
};

static NEXT_ENGINE: AtomicU64 = AtomicU64::new(1);

const CHAR_WIDTH: f32 = 10.0;
const CHAR_HEIGHT: f32 = 12.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub permissions: Option<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub pages: Vec<FixturePage>,
    #[serde(default)]
    pub bookmarks: Vec<FixtureBookmark>,
    #[serde(default)]
    pub attachments: Vec<FixtureAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub annotations: Vec<FixtureAnnotation>,
    #[serde(default = "default_render_units")]
    pub render_units: u32,
}

fn default_render_units() -> u32 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureAnnotation {
    pub subtype: AnnotationSubtype,
    pub rect: Rect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBookmark {
    pub title: String,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub children: Vec<FixtureBookmark>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureAttachment {
    pub name: String,
    pub data: Vec<u8>,
}

impl Fixture {
    /// `count` letter-sized pages with text "page N"
    pub fn with_pages(count: usize) -> Self {
        Self {
            version: Some(17),
            pages: (0..count)
                .map(|i| FixturePage {
                    width: 612.0,
                    height: 792.0,
                    text: format!("page {}", i + 1),
                    rotation: Rotation::None,
                    annotations: Vec::new(),
                    render_units: default_render_units(),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn source(&self) -> DocumentSource {
        DocumentSource::from_bytes(self.to_bytes())
    }

    fn bookmark(&self, path: &[usize]) -> Option<&FixtureBookmark> {
        let (first, rest) = path.split_first()?;
        let mut node = self.bookmarks.get(*first)?;
        for index in rest {
            node = node.children.get(*index)?;
        }
        Some(node)
    }
}

/// When one engine call ran
#[derive(Debug, Clone)]
pub struct CallSpan {
    pub engine: u64,
    pub call: &'static str,
    pub start: Instant,
    pub end: Instant,
}

impl CallSpan {
    pub fn overlaps(&self, other: &CallSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Knobs shared between a test and every engine it creates
#[derive(Debug, Default)]
pub struct FakeControl {
    delay: Mutex<Duration>,
    spans: Mutex<Vec<CallSpan>>,
    fail_next: Mutex<Option<NativeFailure>>,
    panic_next: AtomicBool,
    created: AtomicU64,
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_next(&self, failure: NativeFailure) {
        *self.fail_next.lock() = Some(failure);
    }

    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn spans(&self) -> Vec<CallSpan> {
        self.spans.lock().clone()
    }

    pub fn spans_of(&self, call: &str) -> Vec<CallSpan> {
        self.spans().into_iter().filter(|s| s.call == call).collect()
    }

    pub fn engines_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Factory producing engines wired to this control
    pub fn factory(self: &Arc<Self>) -> Arc<dyn EngineFactory> {
        let control = Arc::clone(self);
        Arc::new(move || -> NativeResult<Box<dyn NativeEngine>> {
            Ok(Box::new(FakeEngine::new(Arc::clone(&control))))
        })
    }
}

struct SpanGuard {
    control: Arc<FakeControl>,
    engine: u64,
    call: &'static str,
    start: Instant,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.control.spans.lock().push(CallSpan {
            engine: self.engine,
            call: self.call,
            start: self.start,
            end: Instant::now(),
        });
    }
}

struct PageState {
    document: u64,
    index: usize,
    rotation: Rotation,
    annotations: Vec<FixtureAnnotation>,
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
    done: u32,
    total: u32,
    shade: u8,
}

enum Object {
    Document(Fixture),
    Page(PageState),
    TextPage(Vec<char>),
    Search(SearchState),
    Annotation(FixtureAnnotation),
    Bookmark { document: u64, path: Vec<usize> },
    Attachment(FixtureAttachment),
    Bitmap(BitmapState),
}

pub struct FakeEngine {
    id: u64,
    control: Arc<FakeControl>,
    next_handle: u64,
    objects: HashMap<u64, Object>,
    renders: HashMap<u64, RenderJob>,
}

fn unknown<T>() -> NativeResult<T> {
    Err(NativeFailure::LastError(NativeErrorCode::Unknown))
}

impl FakeEngine {
    pub fn new(control: Arc<FakeControl>) -> Self {
        control.created.fetch_add(1, Ordering::SeqCst);
        Self {
            id: NEXT_ENGINE.fetch_add(1, Ordering::SeqCst),
            control,
            next_handle: 1,
            objects: HashMap::new(),
            renders: HashMap::new(),
        }
    }

    fn enter(&self, call: &'static str) -> NativeResult<SpanGuard> {
        let start = Instant::now();
        let delay = *self.control.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.control.panic_next.swap(false, Ordering::SeqCst) {
            panic!("injected panic in {call}");
        }
        if let Some(failure) = self.control.fail_next.lock().take() {
            return Err(failure);
        }
        Ok(SpanGuard {
            control: Arc::clone(&self.control),
            engine: self.id,
            call,
            start,
        })
    }

    fn insert(&mut self, object: Object) -> RawHandle {
        let raw = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(raw, object);
        RawHandle(NonZeroU64::MIN.saturating_add(raw - 1))
    }

    fn remove(&mut self, handle: RawHandle) -> NativeResult<Object> {
        self.objects.remove(&handle.get()).map_or_else(unknown, Ok)
    }

    fn document(&self, handle: RawHandle) -> NativeResult<&Fixture> {
        match self.objects.get(&handle.get()) {
            Some(Object::Document(fixture)) => Ok(fixture),
            _ => unknown(),
        }
    }

    fn page(&self, handle: RawHandle) -> NativeResult<&PageState> {
        match self.objects.get(&handle.get()) {
            Some(Object::Page(page)) => Ok(page),
            _ => unknown(),
        }
    }

    fn page_mut(&mut self, handle: RawHandle) -> NativeResult<&mut PageState> {
        match self.objects.get_mut(&handle.get()) {
            Some(Object::Page(page)) => Ok(page),
            _ => unknown(),
        }
    }

    fn fixture_page(&self, page: &PageState) -> NativeResult<&FixturePage> {
        match self.objects.get(&page.document) {
            Some(Object::Document(fixture)) => fixture.pages.get(page.index).map_or_else(unknown, Ok),
            _ => unknown(),
        }
    }

    fn text(&self, handle: RawHandle) -> NativeResult<&Vec<char>> {
        match self.objects.get(&handle.get()) {
            Some(Object::TextPage(text)) => Ok(text),
            _ => unknown(),
        }
    }

    fn search_mut(&mut self, handle: RawHandle) -> NativeResult<&mut SearchState> {
        match self.objects.get_mut(&handle.get()) {
            Some(Object::Search(search)) => Ok(search),
            _ => unknown(),
        }
    }

    fn annotation_ref(&self, handle: RawHandle) -> NativeResult<&FixtureAnnotation> {
        match self.objects.get(&handle.get()) {
            Some(Object::Annotation(annotation)) => Ok(annotation),
            _ => unknown(),
        }
    }

    fn bookmark_path(&self, handle: RawHandle) -> NativeResult<&Vec<usize>> {
        match self.objects.get(&handle.get()) {
            Some(Object::Bookmark { path, .. }) => Ok(path),
            _ => unknown(),
        }
    }

    fn bookmark_node(&self, handle: RawHandle) -> NativeResult<&FixtureBookmark> {
        match self.objects.get(&handle.get()) {
            Some(Object::Bookmark { document, path }) => match self.objects.get(document) {
                Some(Object::Document(fixture)) => fixture.bookmark(path).map_or_else(unknown, Ok),
                _ => unknown(),
            },
            _ => unknown(),
        }
    }

    fn attachment_ref(&self, handle: RawHandle) -> NativeResult<&FixtureAttachment> {
        match self.objects.get(&handle.get()) {
            Some(Object::Attachment(attachment)) => Ok(attachment),
            _ => unknown(),
        }
    }

    fn bitmap_mut(&mut self, handle: RawHandle) -> NativeResult<&mut BitmapState> {
        match self.objects.get_mut(&handle.get()) {
            Some(Object::Bitmap(bitmap)) => Ok(bitmap),
            _ => unknown(),
        }
    }

    fn bookmark_at(&mut self, document: RawHandle, path: Vec<usize>) -> NativeResult<Option<RawHandle>> {
        if self.document(document)?.bookmark(&path).is_none() {
            return Ok(None);
        }
        Ok(Some(self.insert(Object::Bookmark {
            document: document.get(),
            path,
        })))
    }

    /// Run render units until done or until `pause` asks to stop
    fn step(&mut self, page: RawHandle, pause: &mut dyn FnMut() -> bool) -> NativeResult<RenderStatus> {
        let Some(job) = self.renders.get_mut(&page.get()) else {
            return unknown();
        };
        let (bitmap, shade) = (job.bitmap, job.shade);
        while job.done < job.total {
            let (done, total) = (job.done, job.total);
            if let Some(Object::Bitmap(state)) = self.objects.get_mut(&bitmap) {
                let rows = state.info.height as usize;
                let from = rows * done as usize / total as usize;
                let to = rows * (done as usize + 1) / total as usize;
                let stride = state.info.stride;
                state.buffer[from * stride..to * stride].fill(shade);
            }
            job.done += 1;
            if job.done < job.total && pause() {
                return Ok(RenderStatus::ToBeContinued);
            }
        }
        Ok(RenderStatus::Done)
    }

    fn begin_render(&mut self, bitmap: RawHandle, page: RawHandle) -> NativeResult<()> {
        let state = self.page(page)?;
        let total = self.fixture_page(state)?.render_units.max(1);
        let shade = (state.index % 200) as u8 + 1;
        self.bitmap_mut(bitmap)?;
        self.renders.insert(
            page.get(),
            RenderJob {
                bitmap: bitmap.get(),
                done: 0,
                total,
                shade,
            },
        );
        Ok(())
    }
}

impl NativeEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn load_document(&mut self, source: &DocumentSource, password: Option<&str>) -> NativeResult<RawHandle> {
        let _span = self.enter("load_document")?;
        let data = source
            .read()
            .map_err(|_| NativeFailure::LastError(NativeErrorCode::File))?;
        let fixture: Fixture = serde_json::from_slice(&data)
            .map_err(|_| NativeFailure::LastError(NativeErrorCode::Format))?;
        if let Some(expected) = &fixture.password {
            if password != Some(expected.as_str()) {
                return Err(NativeFailure::LastError(NativeErrorCode::Password));
            }
        }
        Ok(self.insert(Object::Document(fixture)))
    }

    fn create_document(&mut self) -> NativeResult<RawHandle> {
        let _span = self.enter("create_document")?;
        Ok(self.insert(Object::Document(Fixture::default())))
    }

    fn close_document(&mut self, document: RawHandle) -> NativeResult<()> {
        let _span = self.enter("close_document")?;
        self.remove(document).map(|_| ())
    }

    fn page_count(&mut self, document: RawHandle) -> NativeResult<usize> {
        let _span = self.enter("page_count")?;
        Ok(self.document(document)?.pages.len())
    }

    fn file_version(&mut self, document: RawHandle) -> NativeResult<Option<u32>> {
        let _span = self.enter("file_version")?;
        Ok(self.document(document)?.version)
    }

    fn permissions(&mut self, document: RawHandle) -> NativeResult<Permissions> {
        let _span = self.enter("permissions")?;
        Ok(self
            .document(document)?
            .permissions
            .map(Permissions)
            .unwrap_or_else(Permissions::all))
    }

    fn metadata(&mut self, document: RawHandle, tag: MetadataTag) -> NativeResult<String> {
        let _span = self.enter("metadata")?;
        Ok(self
            .document(document)?
            .metadata
            .get(&tag.to_string())
            .cloned()
            .unwrap_or_default())
    }

    fn save_copy(&mut self, document: RawHandle, _mode: SaveMode) -> NativeResult<Vec<u8>> {
        let _span = self.enter("save_copy")?;
        Ok(self.document(document)?.to_bytes())
    }

    fn load_page(&mut self, document: RawHandle, index: usize) -> NativeResult<RawHandle> {
        let _span = self.enter("load_page")?;
        let fixture = self.document(document)?;
        let Some(page) = fixture.pages.get(index) else {
            return Err(NativeFailure::LastError(NativeErrorCode::Page));
        };
        let state = PageState {
            document: document.get(),
            index,
            rotation: page.rotation,
            annotations: page.annotations.clone(),
        };
        Ok(self.insert(Object::Page(state)))
    }

    fn close_page(&mut self, page: RawHandle) -> NativeResult<()> {
        let _span = self.enter("close_page")?;
        self.renders.remove(&page.get());
        self.remove(page).map(|_| ())
    }

    fn page_size(&mut self, page: RawHandle) -> NativeResult<PageSize> {
        let _span = self.enter("page_size")?;
        let fixture = self.fixture_page(self.page(page)?)?;
        Ok(PageSize {
            width: fixture.width,
            height: fixture.height,
        })
    }

    fn page_rotation(&mut self, page: RawHandle) -> NativeResult<Rotation> {
        let _span = self.enter("page_rotation")?;
        Ok(self.page(page)?.rotation)
    }

    fn set_page_rotation(&mut self, page: RawHandle, rotation: Rotation) -> NativeResult<()> {
        let _span = self.enter("set_page_rotation")?;
        self.page_mut(page)?.rotation = rotation;
        Ok(())
    }

    fn flatten_page(&mut self, page: RawHandle, _mode: FlattenMode) -> NativeResult<FlattenResult> {
        let _span = self.enter("flatten_page")?;
        let state = self.page_mut(page)?;
        if state.annotations.is_empty() {
            return Ok(FlattenResult::NothingToDo);
        }
        state.annotations.clear();
        Ok(FlattenResult::Success)
    }

    fn load_text_page(&mut self, page: RawHandle) -> NativeResult<RawHandle> {
        let _span = self.enter("load_text_page")?;
        let text: Vec<char> = self.fixture_page(self.page(page)?)?.text.chars().collect();
        Ok(self.insert(Object::TextPage(text)))
    }

    fn close_text_page(&mut self, text_page: RawHandle) -> NativeResult<()> {
        let _span = self.enter("close_text_page")?;
        self.remove(text_page).map(|_| ())
    }

    fn char_count(&mut self, text_page: RawHandle) -> NativeResult<usize> {
        let _span = self.enter("char_count")?;
        Ok(self.text(text_page)?.len())
    }

    fn text_range(&mut self, text_page: RawHandle, start: usize, count: usize) -> NativeResult<String> {
        let _span = self.enter("text_range")?;
        let text = self.text(text_page)?;
        Ok(text.iter().skip(start).take(count).collect())
    }

    fn char_box(&mut self, text_page: RawHandle, index: usize) -> NativeResult<Rect> {
        let _span = self.enter("char_box")?;
        if index >= self.text(text_page)?.len() {
            return unknown();
        }
        let left = index as f32 * CHAR_WIDTH;
        Ok(Rect::new(left, 0.0, left + CHAR_WIDTH, CHAR_HEIGHT))
    }

    fn find_start(
        &mut self,
        text_page: RawHandle,
        query: &str,
        flags: SearchFlags,
        start_index: Option<usize>,
    ) -> NativeResult<RawHandle> {
        let _span = self.enter("find_start")?;
        let haystack = self.text(text_page)?.clone();
        let matches = super::text_matches(&haystack, query, flags);
        let count = query.chars().count();

        let start = start_index.unwrap_or(0);
        let first = matches.iter().position(|m| *m >= start).unwrap_or(matches.len());
        let search = SearchState {
            matches,
            count,
            position: first as isize - 1,
        };
        Ok(self.insert(Object::Search(search)))
    }

    fn find_next(&mut self, search: RawHandle) -> NativeResult<bool> {
        let _span = self.enter("find_next")?;
        let state = self.search_mut(search)?;
        if state.position + 1 < state.matches.len() as isize {
            state.position += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn find_prev(&mut self, search: RawHandle) -> NativeResult<bool> {
        let _span = self.enter("find_prev")?;
        let state = self.search_mut(search)?;
        if state.position > 0 {
            state.position -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn find_result(&mut self, search: RawHandle) -> NativeResult<SearchMatch> {
        let _span = self.enter("find_result")?;
        let state = self.search_mut(search)?;
        let Some(index) = usize::try_from(state.position)
            .ok()
            .and_then(|p| state.matches.get(p))
        else {
            return unknown();
        };
        Ok(SearchMatch {
            char_index: *index,
            count: state.count,
        })
    }

    fn find_close(&mut self, search: RawHandle) -> NativeResult<()> {
        let _span = self.enter("find_close")?;
        self.remove(search).map(|_| ())
    }

    fn annotation_count(&mut self, page: RawHandle) -> NativeResult<usize> {
        let _span = self.enter("annotation_count")?;
        Ok(self.page(page)?.annotations.len())
    }

    fn annotation(&mut self, page: RawHandle, index: usize) -> NativeResult<RawHandle> {
        let _span = self.enter("annotation")?;
        let annotation = self.page(page)?.annotations.get(index).cloned();
        let Some(annotation) = annotation else {
            return unknown();
        };
        Ok(self.insert(Object::Annotation(annotation)))
    }

    fn annotation_subtype(&mut self, annotation: RawHandle) -> NativeResult<AnnotationSubtype> {
        let _span = self.enter("annotation_subtype")?;
        Ok(self.annotation_ref(annotation)?.subtype)
    }

    fn annotation_rect(&mut self, annotation: RawHandle) -> NativeResult<Rect> {
        let _span = self.enter("annotation_rect")?;
        Ok(self.annotation_ref(annotation)?.rect)
    }

    fn create_annotation(&mut self, page: RawHandle, subtype: AnnotationSubtype) -> NativeResult<RawHandle> {
        let _span = self.enter("create_annotation")?;
        let annotation = FixtureAnnotation {
            subtype,
            rect: Rect::default(),
        };
        self.page_mut(page)?.annotations.push(annotation.clone());
        Ok(self.insert(Object::Annotation(annotation)))
    }

    fn close_annotation(&mut self, annotation: RawHandle) -> NativeResult<()> {
        let _span = self.enter("close_annotation")?;
        self.remove(annotation).map(|_| ())
    }

    fn bookmark_first_child(
        &mut self,
        document: RawHandle,
        parent: Option<RawHandle>,
    ) -> NativeResult<Option<RawHandle>> {
        let _span = self.enter("bookmark_first_child")?;
        let mut path = match parent {
            Some(parent) => self.bookmark_path(parent)?.clone(),
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
        let _span = self.enter("bookmark_next_sibling")?;
        let mut path = self.bookmark_path(bookmark)?.clone();
        match path.last_mut() {
            Some(last) => *last += 1,
            None => return unknown(),
        }
        self.bookmark_at(document, path)
    }

    fn bookmark_title(&mut self, bookmark: RawHandle) -> NativeResult<String> {
        let _span = self.enter("bookmark_title")?;
        Ok(self.bookmark_node(bookmark)?.title.clone())
    }

    fn bookmark_page(&mut self, document: RawHandle, bookmark: RawHandle) -> NativeResult<Option<usize>> {
        let _span = self.enter("bookmark_page")?;
        self.document(document)?;
        Ok(self.bookmark_node(bookmark)?.page)
    }

    fn attachment_count(&mut self, document: RawHandle) -> NativeResult<usize> {
        let _span = self.enter("attachment_count")?;
        Ok(self.document(document)?.attachments.len())
    }

    fn attachment(&mut self, document: RawHandle, index: usize) -> NativeResult<RawHandle> {
        let _span = self.enter("attachment")?;
        let attachment = self.document(document)?.attachments.get(index).cloned();
        let Some(attachment) = attachment else {
            return unknown();
        };
        Ok(self.insert(Object::Attachment(attachment)))
    }

    fn attachment_name(&mut self, attachment: RawHandle) -> NativeResult<String> {
        let _span = self.enter("attachment_name")?;
        Ok(self.attachment_ref(attachment)?.name.clone())
    }

    fn attachment_file(&mut self, attachment: RawHandle) -> NativeResult<Vec<u8>> {
        let _span = self.enter("attachment_file")?;
        Ok(self.attachment_ref(attachment)?.data.clone())
    }

    fn create_bitmap(&mut self, width: u32, height: u32, format: BitmapFormat) -> NativeResult<RawHandle> {
        let _span = self.enter("create_bitmap")?;
        let info = BitmapInfo::checked(width, height, format)
            .ok_or(NativeFailure::LastError(NativeErrorCode::Unknown))?;
        let buffer = vec![0; info.buffer_len()];
        Ok(self.insert(Object::Bitmap(BitmapState { info, buffer })))
    }

    fn fill_rect(&mut self, bitmap: RawHandle, rect: PixelRect, color: Color) -> NativeResult<()> {
        let _span = self.enter("fill_rect")?;
        let state = self.bitmap_mut(bitmap)?;
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
        let _span = self.enter("bitmap_info")?;
        Ok(self.bitmap_mut(bitmap)?.info)
    }

    fn bitmap_buffer(&mut self, bitmap: RawHandle) -> NativeResult<Vec<u8>> {
        let _span = self.enter("bitmap_buffer")?;
        Ok(self.bitmap_mut(bitmap)?.buffer.clone())
    }

    fn destroy_bitmap(&mut self, bitmap: RawHandle) -> NativeResult<()> {
        let _span = self.enter("destroy_bitmap")?;
        self.renders.retain(|_, job| job.bitmap != bitmap.get());
        self.remove(bitmap).map(|_| ())
    }

    fn render_page_bitmap(
        &mut self,
        bitmap: RawHandle,
        page: RawHandle,
        _viewport: Viewport,
        _rotation: Rotation,
        _flags: RenderFlags,
    ) -> NativeResult<()> {
        let _span = self.enter("render_page_bitmap")?;
        self.begin_render(bitmap, page)?;
        let status = self.step(page, &mut || false);
        self.renders.remove(&page.get());
        status.map(|_| ())
    }

    fn render_start(
        &mut self,
        bitmap: RawHandle,
        page: RawHandle,
        _viewport: Viewport,
        _rotation: Rotation,
        _flags: RenderFlags,
        pause: &mut dyn FnMut() -> bool,
    ) -> NativeResult<RenderStatus> {
        let _span = self.enter("render_start")?;
        self.begin_render(bitmap, page)?;
        self.step(page, pause)
    }

    fn render_continue(&mut self, page: RawHandle, pause: &mut dyn FnMut() -> bool) -> NativeResult<RenderStatus> {
        let _span = self.enter("render_continue")?;
        self.step(page, pause)
    }

    fn render_close(&mut self, page: RawHandle) -> NativeResult<()> {
        let _span = self.enter("render_close")?;
        self.renders.remove(&page.get());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (Arc<FakeControl>, FakeEngine) {
        let control = FakeControl::new();
        let engine = FakeEngine::new(Arc::clone(&control));
        (control, engine)
    }

    #[test]
    fn test_password_none_and_empty_differ() {
        let (_, mut engine) = engine();
        let source = Fixture::with_pages(1).with_password("").source();

        assert_eq!(
            engine.load_document(&source, None),
            Err(NativeFailure::LastError(NativeErrorCode::Password))
        );
        assert!(engine.load_document(&source, Some("")).is_ok());
    }

    #[test]
    fn test_non_fixture_bytes_are_format_errors() {
        let (_, mut engine) = engine();
        let source = DocumentSource::from_bytes(b"%PDF-1.7 garbage".to_vec());
        assert_eq!(
            engine.load_document(&source, None),
            Err(NativeFailure::LastError(NativeErrorCode::Format))
        );
    }

    #[test]
    fn test_progressive_steps_pause_between_units() {
        let (_, mut engine) = engine();
        let doc = engine.load_document(&Fixture::with_pages(1).source(), None).unwrap();
        let page = engine.load_page(doc, 0).unwrap();
        let bitmap = engine.create_bitmap(4, 4, BitmapFormat::Gray).unwrap();
        let viewport = Viewport::full(&engine.bitmap_info(bitmap).unwrap());

        let status = engine
            .render_start(bitmap, page, viewport, Rotation::None, RenderFlags::default(), &mut || true)
            .unwrap();
        assert_eq!(status, RenderStatus::ToBeContinued);

        let status = engine.render_continue(page, &mut || false).unwrap();
        assert_eq!(status, RenderStatus::Done);
        assert!(engine.bitmap_buffer(bitmap).unwrap().iter().all(|b| *b == 1));
    }

    #[test]
    fn test_search_walks_matches() {
        let (_, mut engine) = engine();
        let mut fixture = Fixture::with_pages(1);
        fixture.pages[0].text = "Ab ab AB".to_string();
        let doc = engine.load_document(&fixture.source(), None).unwrap();
        let page = engine.load_page(doc, 0).unwrap();
        let text = engine.load_text_page(page).unwrap();

        let search = engine.find_start(text, "ab", SearchFlags::default(), None).unwrap();
        assert!(engine.find_next(search).unwrap());
        assert!(engine.find_next(search).unwrap());
        assert_eq!(
            engine.find_result(search).unwrap(),
            SearchMatch {
                char_index: 3,
                count: 2
            }
        );
        assert!(engine.find_next(search).unwrap());
        assert!(!engine.find_next(search).unwrap());
        assert!(engine.find_prev(search).unwrap());
    }

    #[test]
    fn test_control_records_spans_and_injects_failures() {
        let (control, mut engine) = engine();
        control.fail_next(NativeFailure::Fatal("boom".into()));
        assert!(engine.create_document().is_err());
        assert!(engine.create_document().is_ok());
        assert_eq!(control.spans_of("create_document").len(), 1);
    }
}
