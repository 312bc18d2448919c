//! Native engine adapter
//!
//! Translates one typed request into one native call, or a short fixed
//! sequence of them, against the worker's session. Every reference is
//! resolved through the registry before the engine sees a handle, so a
//! stale or forged reference ends as `InvalidReference` here.

use crate::error::{DispatchError, Result};
use crate::progressive::RenderState;
use crate::protocol::requests as rq;
use crate::protocol::responses as rs;
use crate::protocol::types::{
    AnnotationInfo, AttachmentInfo, BitmapInfo, BookmarkNode, Color, Output, PixelRect,
    RenderStatus, Rotation, Viewport,
};
use crate::engine::RawHandle;
use crate::protocol::{PausePredicate, Request, Response};
use crate::references::{BookmarkRef, DocumentRef, Reference, ReferenceKind};

use super::session::{typed, Origin, Session};

/// Outline depth walked by `GetBookmarks`; outlines may contain cycles
const MAX_BOOKMARK_DEPTH: usize = 64;

impl Session {
    /// Execute one request
    pub fn execute(&mut self, request: Request) -> Result<Response> {
        self.operation = request.operation().as_str();
        if let Some(reason) = self.fatal() {
            return Err(DispatchError::WorkerUnavailable(reason.to_string()));
        }

        let response = match request {
            // Documents
            Request::OpenDocument(rq::OpenDocument { source, password }) => {
                let handle = self.call(|e| e.load_document(&source, password.as_deref()))?;
                let document = self.adopt(ReferenceKind::Document, None, handle)?;
                rs::OpenDocument {
                    document: typed(document)?,
                }
                .into()
            }
            Request::CreateDocument(rq::CreateDocument {}) => {
                let handle = self.call(|e| e.create_document())?;
                let document = self.adopt(ReferenceKind::Document, None, handle)?;
                rs::CreateDocument {
                    document: typed(document)?,
                }
                .into()
            }
            Request::CloseDocument(rq::CloseDocument { document }) => {
                self.resolve(document)?;
                self.release(document.reference());
                rs::CloseDocument {}.into()
            }
            Request::GetPageCount(rq::GetPageCount { document }) => {
                let handle = self.resolve(document)?;
                let page_count = self.call(|e| e.page_count(handle))?;
                rs::GetPageCount { page_count }.into()
            }
            Request::GetFileVersion(rq::GetFileVersion { document }) => {
                let handle = self.resolve(document)?;
                let file_version = self.call(|e| e.file_version(handle))?;
                rs::GetFileVersion { file_version }.into()
            }
            Request::GetDocPermissions(rq::GetDocPermissions { document }) => {
                let handle = self.resolve(document)?;
                let permissions = self.call(|e| e.permissions(handle))?;
                rs::GetDocPermissions { permissions }.into()
            }
            Request::GetMetadata(rq::GetMetadata { document, tag }) => {
                let handle = self.resolve(document)?;
                let value = self.call(|e| e.metadata(handle, tag))?;
                rs::GetMetadata { tag, value }.into()
            }
            Request::SaveAsCopy(rq::SaveAsCopy {
                document,
                mode,
                output,
            }) => {
                let handle = self.resolve(document)?;
                let data = self.call(|e| e.save_copy(handle, mode))?;
                rs::SaveAsCopy {
                    output: Output::deliver(&output, data)?,
                }
                .into()
            }

            // Pages
            Request::LoadPage(rq::LoadPage { document, index }) => {
                let handle = self.resolve(document)?;
                let (page, _) = self.load_page(document.reference(), handle, index)?;
                rs::LoadPage { page: typed(page)? }.into()
            }
            Request::ClosePage(rq::ClosePage { page }) => {
                self.resolve(page)?;
                self.release(page.reference());
                rs::ClosePage {}.into()
            }
            Request::GetPageSize(rq::GetPageSize { page }) => {
                let (page, handle) = self.page(page)?;
                let size = self.call(|e| e.page_size(handle))?;
                rs::GetPageSize {
                    page: typed(page)?,
                    size,
                }
                .into()
            }
            Request::GetPageRotation(rq::GetPageRotation { page }) => {
                let (page, handle) = self.page(page)?;
                let rotation = self.call(|e| e.page_rotation(handle))?;
                rs::GetPageRotation {
                    page: typed(page)?,
                    rotation,
                }
                .into()
            }
            Request::SetPageRotation(rq::SetPageRotation { page, rotation }) => {
                let (_, handle) = self.page(page)?;
                self.call(|e| e.set_page_rotation(handle, rotation))?;
                rs::SetPageRotation {}.into()
            }
            Request::FlattenPage(rq::FlattenPage { page, mode }) => {
                let (page, handle) = self.page(page)?;
                let result = self.call(|e| e.flatten_page(handle, mode))?;
                // annotation indices shift once annotations are merged into content
                self.forget_origins(|origin| {
                    matches!(origin, Origin::Annotation { page: of, .. } if *of == page)
                });
                rs::FlattenPage { result }.into()
            }

            // Text
            Request::LoadTextPage(rq::LoadTextPage { page }) => {
                let (page, handle) = self.page(page)?;
                let text_handle = self.call(|e| e.load_text_page(handle))?;
                let text_page = self.adopt(ReferenceKind::TextPage, Some(page), text_handle)?;
                rs::LoadTextPage {
                    text_page: typed(text_page)?,
                }
                .into()
            }
            Request::CloseTextPage(rq::CloseTextPage { text_page }) => {
                self.resolve(text_page)?;
                self.release(text_page.reference());
                rs::CloseTextPage {}.into()
            }
            Request::CountChars(rq::CountChars { text_page }) => {
                let handle = self.resolve(text_page)?;
                let count = self.call(|e| e.char_count(handle))?;
                rs::CountChars { count }.into()
            }
            Request::GetText(rq::GetText {
                text_page,
                start,
                count,
            }) => {
                let handle = self.resolve(text_page)?;
                let count = match count {
                    Some(count) => count,
                    None => self.call(|e| e.char_count(handle))?.saturating_sub(start),
                };
                let text = self.call(|e| e.text_range(handle, start, count))?;
                rs::GetText { text }.into()
            }
            Request::GetCharBox(rq::GetCharBox { text_page, index }) => {
                let handle = self.resolve(text_page)?;
                let rect = self.call(|e| e.char_box(handle, index))?;
                rs::GetCharBox { rect }.into()
            }
            Request::GetPageText(rq::GetPageText { page }) => {
                let (_, handle) = self.page(page)?;
                rs::GetPageText {
                    text: self.page_text(handle)?,
                }
                .into()
            }

            // Search
            Request::FindStart(rq::FindStart {
                text_page,
                query,
                flags,
                start_index,
            }) => {
                if query.is_empty() {
                    return Err(DispatchError::InvalidRequest("empty search query".into()));
                }
                let handle = self.resolve(text_page)?;
                let search = self.call(|e| e.find_start(handle, &query, flags, start_index))?;
                let search = self.adopt(
                    ReferenceKind::SearchHandle,
                    Some(text_page.reference()),
                    search,
                )?;
                rs::FindStart {
                    search: typed(search)?,
                }
                .into()
            }
            Request::FindNext(rq::FindNext { search }) => {
                let handle = self.resolve(search)?;
                let found = self.call(|e| e.find_next(handle))?;
                rs::FindNext { found }.into()
            }
            Request::FindPrev(rq::FindPrev { search }) => {
                let handle = self.resolve(search)?;
                let found = self.call(|e| e.find_prev(handle))?;
                rs::FindPrev { found }.into()
            }
            Request::GetSearchResult(rq::GetSearchResult { search }) => {
                let handle = self.resolve(search)?;
                let hit = self.call(|e| e.find_result(handle))?;
                rs::GetSearchResult {
                    char_index: hit.char_index,
                    count: hit.count,
                }
                .into()
            }
            Request::FindClose(rq::FindClose { search }) => {
                self.resolve(search)?;
                self.release(search.reference());
                rs::FindClose {}.into()
            }

            // Annotations
            Request::GetAnnotationCount(rq::GetAnnotationCount { page }) => {
                let (_, handle) = self.page(page)?;
                let count = self.call(|e| e.annotation_count(handle))?;
                rs::GetAnnotationCount { count }.into()
            }
            Request::GetAnnotation(rq::GetAnnotation { page, index }) => {
                let (page, handle) = self.page(page)?;
                let annotation = self.annotation(page, handle, index)?;
                rs::GetAnnotation {
                    annotation: typed(annotation)?,
                }
                .into()
            }
            Request::GetAnnotations(rq::GetAnnotations { page }) => {
                let (page, handle) = self.page(page)?;
                let count = self.call(|e| e.annotation_count(handle))?;
                let mut annotations = Vec::with_capacity(count);
                for index in 0..count {
                    let annotation = self.annotation(page, handle, index)?;
                    let annotation_handle = self.registry.resolve(annotation)?;
                    let subtype = self.call(|e| e.annotation_subtype(annotation_handle))?;
                    let rect = self.call(|e| e.annotation_rect(annotation_handle))?;
                    annotations.push(AnnotationInfo {
                        annotation: typed(annotation)?,
                        index,
                        subtype,
                        rect,
                    });
                }
                rs::GetAnnotations { annotations }.into()
            }
            Request::CreateAnnotation(rq::CreateAnnotation { page, subtype }) => {
                if !subtype.is_creatable() {
                    return Err(DispatchError::UnsupportedOperation(format!(
                        "cannot create {subtype:?} annotations"
                    )));
                }
                let (page, handle) = self.page(page)?;
                let annotation = self.call(|e| e.create_annotation(handle, subtype))?;
                let annotation = self.adopt(ReferenceKind::Annotation, Some(page), annotation)?;
                rs::CreateAnnotation {
                    annotation: typed(annotation)?,
                }
                .into()
            }
            Request::GetAnnotationSubtype(rq::GetAnnotationSubtype { annotation }) => {
                let handle = self.resolve(annotation)?;
                let subtype = self.call(|e| e.annotation_subtype(handle))?;
                rs::GetAnnotationSubtype { subtype }.into()
            }
            Request::GetAnnotationRect(rq::GetAnnotationRect { annotation }) => {
                let handle = self.resolve(annotation)?;
                let rect = self.call(|e| e.annotation_rect(handle))?;
                rs::GetAnnotationRect { rect }.into()
            }
            Request::CloseAnnotation(rq::CloseAnnotation { annotation }) => {
                self.resolve(annotation)?;
                self.release(annotation.reference());
                rs::CloseAnnotation {}.into()
            }

            // Bookmarks
            Request::GetFirstChildBookmark(rq::GetFirstChildBookmark { document, parent }) => {
                let bookmark = self.first_child_bookmark(document, parent)?;
                rs::GetFirstChildBookmark { bookmark }.into()
            }
            Request::GetNextSiblingBookmark(rq::GetNextSiblingBookmark { document, bookmark }) => {
                let bookmark = self.next_sibling_bookmark(document, bookmark)?;
                rs::GetNextSiblingBookmark { bookmark }.into()
            }
            Request::GetBookmarkTitle(rq::GetBookmarkTitle { bookmark }) => {
                let handle = self.resolve(bookmark)?;
                let title = self.call(|e| e.bookmark_title(handle))?;
                rs::GetBookmarkTitle { title }.into()
            }
            Request::GetBookmarks(rq::GetBookmarks { document }) => {
                let bookmarks = self.bookmark_tree(document, None, 0)?;
                rs::GetBookmarks { bookmarks }.into()
            }

            // Attachments
            Request::GetAttachmentCount(rq::GetAttachmentCount { document }) => {
                let handle = self.resolve(document)?;
                let count = self.call(|e| e.attachment_count(handle))?;
                rs::GetAttachmentCount { count }.into()
            }
            Request::GetAttachment(rq::GetAttachment { document, index }) => {
                let attachment = self.attachment(document, index)?;
                rs::GetAttachment {
                    attachment: typed(attachment)?,
                }
                .into()
            }
            Request::GetAttachmentName(rq::GetAttachmentName { attachment }) => {
                let handle = self.resolve(attachment)?;
                let name = self.call(|e| e.attachment_name(handle))?;
                rs::GetAttachmentName { name }.into()
            }
            Request::GetAttachmentFile(rq::GetAttachmentFile { attachment, output }) => {
                let handle = self.resolve(attachment)?;
                let data = self.call(|e| e.attachment_file(handle))?;
                rs::GetAttachmentFile {
                    output: Output::deliver(&output, data)?,
                }
                .into()
            }
            Request::GetAttachments(rq::GetAttachments { document }) => {
                let handle = self.resolve(document)?;
                let count = self.call(|e| e.attachment_count(handle))?;
                let mut attachments = Vec::with_capacity(count);
                for index in 0..count {
                    let attachment = self.attachment(document, index)?;
                    let attachment_handle = self.registry.resolve(attachment)?;
                    let name = self.call(|e| e.attachment_name(attachment_handle))?;
                    attachments.push(AttachmentInfo {
                        attachment: typed(attachment)?,
                        index,
                        name,
                    });
                }
                rs::GetAttachments { attachments }.into()
            }

            // Bitmaps
            Request::CreateBitmap(rq::CreateBitmap {
                document,
                width,
                height,
                format,
            }) => {
                if BitmapInfo::checked(width, height, format).is_none() {
                    return Err(DispatchError::InvalidRequest(format!(
                        "bitmap size {width}x{height}"
                    )));
                }
                self.resolve(document)?;
                let handle = self.call(|e| e.create_bitmap(width, height, format))?;
                let bitmap = self.adopt(ReferenceKind::Bitmap, Some(document.reference()), handle)?;
                rs::CreateBitmap {
                    bitmap: typed(bitmap)?,
                }
                .into()
            }
            Request::FillRect(rq::FillRect {
                bitmap,
                rect,
                color,
            }) => {
                let handle = self.resolve(bitmap)?;
                self.call(|e| e.fill_rect(handle, rect, color))?;
                rs::FillRect {}.into()
            }
            Request::GetBitmapInfo(rq::GetBitmapInfo { bitmap }) => {
                let handle = self.resolve(bitmap)?;
                let info = self.call(|e| e.bitmap_info(handle))?;
                rs::GetBitmapInfo { info }.into()
            }
            Request::GetBitmapBuffer(rq::GetBitmapBuffer { bitmap, output }) => {
                let handle = self.resolve(bitmap)?;
                let info = self.call(|e| e.bitmap_info(handle))?;
                let data = self.call(|e| e.bitmap_buffer(handle))?;
                rs::GetBitmapBuffer {
                    info,
                    output: Output::deliver(&output, data)?,
                }
                .into()
            }
            Request::DestroyBitmap(rq::DestroyBitmap { bitmap }) => {
                self.resolve(bitmap)?;
                self.release(bitmap.reference());
                rs::DestroyBitmap {}.into()
            }

            // Rendering
            Request::RenderPageBitmap(rq::RenderPageBitmap {
                bitmap,
                page,
                viewport,
                rotation,
                flags,
            }) => {
                let bitmap_handle = self.resolve(bitmap)?;
                let (_, page_handle) = self.page(page)?;
                let viewport = self.viewport(bitmap_handle, viewport)?;
                self.call(|e| {
                    e.render_page_bitmap(bitmap_handle, page_handle, viewport, rotation, flags)
                })?;
                rs::RenderPageBitmap {}.into()
            }
            Request::RenderPage(request) => self.render_page(request)?.into(),

            // Progressive rendering
            Request::StartRender(rq::StartRender {
                bitmap,
                page,
                viewport,
                rotation,
                flags,
                pause,
            }) => {
                let bitmap_handle = self.resolve(bitmap)?;
                let (page, page_handle) = self.page(page)?;
                let viewport = self.viewport(bitmap_handle, viewport)?;

                if self.renders.begin(page, bitmap.reference())? {
                    self.call(|e| e.render_close(page_handle))?;
                }
                let mut pause = pause;
                let mut predicate = move || pause.as_mut().is_some_and(PausePredicate::should_pause);
                let status = self.call(|e| {
                    e.render_start(
                        bitmap_handle,
                        page_handle,
                        viewport,
                        rotation,
                        flags,
                        &mut predicate,
                    )
                });
                let state = self.settle_render(page, page_handle, status)?;
                rs::StartRender {
                    page: typed(page)?,
                    state,
                }
                .into()
            }
            Request::ContinueRender(rq::ContinueRender { page, pause }) => {
                let Some(page) = self.find_page(page)? else {
                    return Err(DispatchError::InvalidState(
                        "no render was started on this page".into(),
                    ));
                };
                self.renders.resume(page)?;
                let page_handle = self.registry.resolve(page)?;
                let mut pause = pause;
                let mut predicate = move || pause.as_mut().is_some_and(PausePredicate::should_pause);
                let status = self.call(|e| e.render_continue(page_handle, &mut predicate));
                let state = self.settle_render(page, page_handle, status)?;
                rs::ContinueRender { state }.into()
            }
            Request::CloseRender(rq::CloseRender { page }) => {
                if let Some(page) = self.find_page(page)? {
                    if self.renders.close(page) {
                        let page_handle = self.registry.resolve(page)?;
                        self.call(|e| e.render_close(page_handle))?;
                    }
                }
                rs::CloseRender {
                    state: RenderState::Closed,
                }
                .into()
            }
            Request::GetRenderState(rq::GetRenderState { page }) => {
                let state = match self.find_page(page)? {
                    Some(page) => self.renders.state(page),
                    None => RenderState::NotStarted,
                };
                rs::GetRenderState { state }.into()
            }
        };

        Ok(response)
    }

    fn page_text(&mut self, page: RawHandle) -> Result<String> {
        let text_page = self.call(|e| e.load_text_page(page))?;
        let text = self
            .call(|e| e.char_count(text_page))
            .and_then(|count| self.call(|e| e.text_range(text_page, 0, count)));
        self.call(|e| e.close_text_page(text_page))?;
        text
    }

    fn annotation(&mut self, page: Reference, handle: RawHandle, index: usize) -> Result<Reference> {
        let origin = Origin::Annotation { page, index };
        if let Some((annotation, _)) = self.derived(origin) {
            return Ok(annotation);
        }
        let annotation = self.call(|e| e.annotation(handle, index))?;
        self.adopt_derived(origin, ReferenceKind::Annotation, Some(page), annotation)
    }

    fn attachment(&mut self, document: DocumentRef, index: usize) -> Result<Reference> {
        let origin = Origin::Attachment {
            document: document.reference(),
            index,
        };
        if let Some((attachment, _)) = self.derived(origin) {
            return Ok(attachment);
        }
        let handle = self.resolve(document)?;
        let attachment = self.call(|e| e.attachment(handle, index))?;
        self.adopt_derived(
            origin,
            ReferenceKind::Attachment,
            Some(document.reference()),
            attachment,
        )
    }

    fn first_child_bookmark(
        &mut self,
        document: DocumentRef,
        parent: Option<BookmarkRef>,
    ) -> Result<Option<BookmarkRef>> {
        let origin = Origin::FirstChild {
            document: document.reference(),
            parent: parent.map(|parent| parent.reference()),
        };
        if let Some((child, _)) = self.derived(origin) {
            return Ok(Some(typed(child)?));
        }
        let handle = self.resolve(document)?;
        let parent = parent.map(|parent| self.resolve(parent)).transpose()?;
        let child = self.call(|e| e.bookmark_first_child(handle, parent))?;
        self.adopt_bookmark(origin, document, child)
    }

    fn next_sibling_bookmark(
        &mut self,
        document: DocumentRef,
        bookmark: BookmarkRef,
    ) -> Result<Option<BookmarkRef>> {
        let origin = Origin::NextSibling {
            bookmark: bookmark.reference(),
        };
        if let Some((sibling, _)) = self.derived(origin) {
            return Ok(Some(typed(sibling)?));
        }
        let handle = self.resolve(document)?;
        let bookmark = self.resolve(bookmark)?;
        let sibling = self.call(|e| e.bookmark_next_sibling(handle, bookmark))?;
        self.adopt_bookmark(origin, document, sibling)
    }

    fn adopt_bookmark(
        &mut self,
        origin: Origin,
        document: DocumentRef,
        handle: Option<RawHandle>,
    ) -> Result<Option<BookmarkRef>> {
        let Some(handle) = handle else {
            return Ok(None);
        };
        let bookmark = self.adopt_derived(
            origin,
            ReferenceKind::Bookmark,
            Some(document.reference()),
            handle,
        )?;
        Ok(Some(typed(bookmark)?))
    }

    fn bookmark_tree(
        &mut self,
        document: DocumentRef,
        parent: Option<BookmarkRef>,
        depth: usize,
    ) -> Result<Vec<BookmarkNode>> {
        let mut nodes = Vec::new();
        if depth >= MAX_BOOKMARK_DEPTH {
            return Ok(nodes);
        }

        let document_handle = self.resolve(document)?;
        let mut next = self.first_child_bookmark(document, parent)?;
        while let Some(bookmark) = next {
            let handle = self.resolve(bookmark)?;
            let title = self.call(|e| e.bookmark_title(handle))?;
            let page_index = self.call(|e| e.bookmark_page(document_handle, handle))?;
            let children = self.bookmark_tree(document, Some(bookmark), depth + 1)?;
            nodes.push(BookmarkNode {
                bookmark,
                title,
                page_index,
                children,
            });
            next = self.next_sibling_bookmark(document, bookmark)?;
        }
        Ok(nodes)
    }

    fn viewport(&mut self, bitmap: RawHandle, viewport: Option<Viewport>) -> Result<Viewport> {
        match viewport {
            Some(viewport) => Ok(viewport),
            None => Ok(Viewport::full(&self.call(|e| e.bitmap_info(bitmap))?)),
        }
    }

    fn render_page(&mut self, request: rq::RenderPage) -> Result<rs::RenderPage> {
        let rq::RenderPage {
            page,
            scale,
            format,
            rotation,
            flags,
            output,
        } = request;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DispatchError::InvalidRequest(format!("render scale {scale}")));
        }

        let (_, page_handle) = self.page(page)?;
        let size = self.call(|e| e.page_size(page_handle))?;
        let (width, height) = match rotation {
            Rotation::Clockwise90 | Rotation::CounterClockwise90 => (size.height, size.width),
            _ => (size.width, size.height),
        };
        let pixels = |points: f32| {
            let pixels = (f64::from(points) * f64::from(scale)).ceil().max(1.0);
            (pixels <= f64::from(i32::MAX as u32)).then_some(pixels as u32)
        };
        let info = pixels(width)
            .zip(pixels(height))
            .and_then(|(width, height)| BitmapInfo::checked(width, height, format))
            .ok_or_else(|| {
                DispatchError::InvalidRequest(format!(
                    "render of {width}x{height}pt at scale {scale} is too large"
                ))
            })?;
        let (width, height) = (info.width, info.height);

        let bitmap = self.call(|e| e.create_bitmap(width, height, format))?;
        let rendered = self
            .call(|e| {
                e.fill_rect(
                    bitmap,
                    PixelRect {
                        left: 0,
                        top: 0,
                        width: width as i32,
                        height: height as i32,
                    },
                    Color::WHITE,
                )
            })
            .and_then(|_| {
                self.call(|e| {
                    e.render_page_bitmap(bitmap, page_handle, Viewport::full(&info), rotation, flags)
                })
            })
            .and_then(|_| self.call(|e| e.bitmap_buffer(bitmap)));
        self.call(|e| e.destroy_bitmap(bitmap))?;

        Ok(rs::RenderPage {
            info,
            output: Output::deliver(&output, rendered?)?,
        })
    }

    /// Apply the engine's answer to a progressive step
    fn settle_render(
        &mut self,
        page: Reference,
        page_handle: RawHandle,
        status: Result<RenderStatus>,
    ) -> Result<RenderState> {
        match status {
            Ok(status) => self.renders.settle(page, status),
            Err(err) => {
                self.renders.fail(page);
                if self.fatal().is_none() {
                    if let Err(failure) = self.engine.render_close(page_handle) {
                        tracing::warn!(page = %page, error = %failure, "render close failed");
                    }
                }
                Err(err)
            }
        }
    }
}
