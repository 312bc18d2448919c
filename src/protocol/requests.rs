//! Request structs, one per operation
//!
//! Optional inputs are `Option`s: an absent password is not the same as an
//! empty one, and an absent viewport means "the whole bitmap".

use serde::{Deserialize, Serialize};

use super::types::{
    AnnotationSubtype, BitmapFormat, Color, FlattenMode, MetadataTag, OutputTarget,
    PageSelector, PixelRect, RenderFlags, Rotation, SaveMode, SearchFlags, Viewport,
};
use super::{PausePredicate, Targets};
use crate::engine::DocumentSource;
use crate::references::{
    AnnotationRef, AttachmentRef, BitmapRef, BookmarkRef, DocumentRef, PageRef, Reference,
    SearchHandleRef, TextPageRef,
};

// Documents

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenDocument {
    pub source: DocumentSource,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDocument {}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseDocument {
    pub document: DocumentRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetPageCount {
    pub document: DocumentRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetFileVersion {
    pub document: DocumentRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetDocPermissions {
    pub document: DocumentRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetMetadata {
    pub document: DocumentRef,
    pub tag: MetadataTag,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveAsCopy {
    pub document: DocumentRef,
    #[serde(default)]
    pub mode: SaveMode,
    #[serde(default)]
    pub output: OutputTarget,
}

// Pages

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadPage {
    pub document: DocumentRef,
    pub index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClosePage {
    pub page: PageRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetPageSize {
    pub page: PageSelector,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetPageRotation {
    pub page: PageSelector,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPageRotation {
    pub page: PageSelector,
    pub rotation: Rotation,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlattenPage {
    pub page: PageSelector,
    #[serde(default)]
    pub mode: FlattenMode,
}

// Text

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadTextPage {
    pub page: PageSelector,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseTextPage {
    pub text_page: TextPageRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountChars {
    pub text_page: TextPageRef,
}

/// Text of `count` characters from `start`; all remaining when `count` is absent
#[derive(Debug, Serialize, Deserialize)]
pub struct GetText {
    pub text_page: TextPageRef,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetCharBox {
    pub text_page: TextPageRef,
    pub index: usize,
}

/// Whole text of a page without keeping a text page around
#[derive(Debug, Serialize, Deserialize)]
pub struct GetPageText {
    pub page: PageSelector,
}

// Search

#[derive(Debug, Serialize, Deserialize)]
pub struct FindStart {
    pub text_page: TextPageRef,
    pub query: String,
    #[serde(default)]
    pub flags: SearchFlags,
    #[serde(default)]
    pub start_index: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FindNext {
    pub search: SearchHandleRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FindPrev {
    pub search: SearchHandleRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetSearchResult {
    pub search: SearchHandleRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FindClose {
    pub search: SearchHandleRef,
}

// Annotations

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAnnotationCount {
    pub page: PageSelector,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAnnotation {
    pub page: PageSelector,
    pub index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAnnotations {
    pub page: PageSelector,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAnnotation {
    pub page: PageSelector,
    pub subtype: AnnotationSubtype,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAnnotationSubtype {
    pub annotation: AnnotationRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAnnotationRect {
    pub annotation: AnnotationRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseAnnotation {
    pub annotation: AnnotationRef,
}

// Bookmarks

/// First child of `parent`, or the first top-level bookmark
#[derive(Debug, Serialize, Deserialize)]
pub struct GetFirstChildBookmark {
    pub document: DocumentRef,
    #[serde(default)]
    pub parent: Option<BookmarkRef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetNextSiblingBookmark {
    pub document: DocumentRef,
    pub bookmark: BookmarkRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetBookmarkTitle {
    pub bookmark: BookmarkRef,
}

/// Whole outline tree
#[derive(Debug, Serialize, Deserialize)]
pub struct GetBookmarks {
    pub document: DocumentRef,
}

// Attachments

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAttachmentCount {
    pub document: DocumentRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAttachment {
    pub document: DocumentRef,
    pub index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAttachmentName {
    pub attachment: AttachmentRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAttachmentFile {
    pub attachment: AttachmentRef,
    #[serde(default)]
    pub output: OutputTarget,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetAttachments {
    pub document: DocumentRef,
}

// Bitmaps

/// Bitmaps are scoped to a document so they are released with it
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateBitmap {
    pub document: DocumentRef,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: BitmapFormat,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FillRect {
    pub bitmap: BitmapRef,
    pub rect: PixelRect,
    pub color: Color,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetBitmapInfo {
    pub bitmap: BitmapRef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetBitmapBuffer {
    pub bitmap: BitmapRef,
    #[serde(default)]
    pub output: OutputTarget,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DestroyBitmap {
    pub bitmap: BitmapRef,
}

// Rendering

#[derive(Debug, Serialize, Deserialize)]
pub struct RenderPageBitmap {
    pub bitmap: BitmapRef,
    pub page: PageSelector,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub flags: RenderFlags,
}

/// Render a page into raw pixels in one call
///
/// The bitmap is sized from the page size times `scale`, filled white,
/// rendered and destroyed again.
#[derive(Debug, Serialize, Deserialize)]
pub struct RenderPage {
    pub page: PageSelector,
    pub scale: f32,
    #[serde(default)]
    pub format: BitmapFormat,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub flags: RenderFlags,
    #[serde(default)]
    pub output: OutputTarget,
}

// Progressive rendering

/// Start a pausable render; without `pause` it runs to completion
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRender {
    pub bitmap: BitmapRef,
    pub page: PageSelector,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub flags: RenderFlags,
    #[serde(skip)]
    pub pause: Option<PausePredicate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContinueRender {
    pub page: PageSelector,
    #[serde(skip)]
    pub pause: Option<PausePredicate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseRender {
    pub page: PageSelector,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRenderState {
    pub page: PageSelector,
}

/// A value that may hold references
pub trait Target {
    fn collect_into(&self, out: &mut Vec<Reference>);
}

macro_rules! reference_targets {
    ($($name:ty),+) => {
        $(
            impl Target for $name {
                fn collect_into(&self, out: &mut Vec<Reference>) {
                    out.push(self.reference());
                }
            }
        )+
    };
}

reference_targets!(
    DocumentRef,
    PageRef,
    BitmapRef,
    AnnotationRef,
    AttachmentRef,
    BookmarkRef,
    TextPageRef,
    SearchHandleRef
);

impl Target for PageSelector {
    fn collect_into(&self, out: &mut Vec<Reference>) {
        match self {
            PageSelector::ByIndex { document, .. } => document.collect_into(out),
            PageSelector::ByReference(page) => page.collect_into(out),
        }
    }
}

impl<T: Target> Target for Option<T> {
    fn collect_into(&self, out: &mut Vec<Reference>) {
        if let Some(value) = self {
            value.collect_into(out);
        }
    }
}

macro_rules! targets {
    ($($request:ident => [$($field:ident),*];)+) => {
        $(
            impl Targets for $request {
                #[allow(unused_mut)]
                fn references(&self) -> Vec<Reference> {
                    let mut out = Vec::new();
                    $(self.$field.collect_into(&mut out);)*
                    out
                }
            }
        )+
    };
}

targets! {
    OpenDocument => [];
    CreateDocument => [];
    CloseDocument => [document];
    GetPageCount => [document];
    GetFileVersion => [document];
    GetDocPermissions => [document];
    GetMetadata => [document];
    SaveAsCopy => [document];
    LoadPage => [document];
    ClosePage => [page];
    GetPageSize => [page];
    GetPageRotation => [page];
    SetPageRotation => [page];
    FlattenPage => [page];
    LoadTextPage => [page];
    CloseTextPage => [text_page];
    CountChars => [text_page];
    GetText => [text_page];
    GetCharBox => [text_page];
    GetPageText => [page];
    FindStart => [text_page];
    FindNext => [search];
    FindPrev => [search];
    GetSearchResult => [search];
    FindClose => [search];
    GetAnnotationCount => [page];
    GetAnnotation => [page];
    GetAnnotations => [page];
    CreateAnnotation => [page];
    GetAnnotationSubtype => [annotation];
    GetAnnotationRect => [annotation];
    CloseAnnotation => [annotation];
    GetFirstChildBookmark => [document, parent];
    GetNextSiblingBookmark => [document, bookmark];
    GetBookmarkTitle => [bookmark];
    GetBookmarks => [document];
    GetAttachmentCount => [document];
    GetAttachment => [document];
    GetAttachmentName => [attachment];
    GetAttachmentFile => [attachment];
    GetAttachments => [document];
    CreateBitmap => [document];
    FillRect => [bitmap];
    GetBitmapInfo => [bitmap];
    GetBitmapBuffer => [bitmap];
    DestroyBitmap => [bitmap];
    RenderPageBitmap => [bitmap, page];
    RenderPage => [page];
    StartRender => [bitmap, page];
    ContinueRender => [page];
    CloseRender => [page];
    GetRenderState => [page];
}
