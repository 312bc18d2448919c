//! Response structs, one per operation
//!
//! Collection fields decode `null` and absent values to empty vectors, so a
//! caller never sees a missing collection after the process wire.

use serde::{Deserialize, Serialize};

use super::types::{
    AnnotationInfo, AnnotationSubtype, AttachmentInfo, BitmapInfo, BookmarkNode, FlattenResult,
    MetadataTag, Output, PageSize, Permissions, Rect, Rotation,
};
use super::wire::seq;
use crate::progressive::RenderState;
use crate::references::{
    AnnotationRef, AttachmentRef, BitmapRef, BookmarkRef, DocumentRef, PageRef, SearchHandleRef,
    TextPageRef,
};

// Documents

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenDocument {
    pub document: DocumentRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDocument {
    pub document: DocumentRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseDocument {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPageCount {
    pub page_count: usize,
}

/// Version as `major * 10 + minor`; absent when the header has none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetFileVersion {
    pub file_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDocPermissions {
    pub permissions: Permissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetMetadata {
    pub tag: MetadataTag,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveAsCopy {
    pub output: Output,
}

// Pages

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPage {
    pub page: PageRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosePage {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPageSize {
    pub page: PageRef,
    pub size: PageSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPageRotation {
    pub page: PageRef,
    pub rotation: Rotation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPageRotation {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlattenPage {
    pub result: FlattenResult,
}

// Text

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTextPage {
    pub text_page: TextPageRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseTextPage {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountChars {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetText {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCharBox {
    pub rect: Rect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPageText {
    pub text: String,
}

// Search

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindStart {
    pub search: SearchHandleRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindNext {
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindPrev {
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSearchResult {
    pub char_index: usize,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindClose {}

// Annotations

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAnnotationCount {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAnnotation {
    pub annotation: AnnotationRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAnnotations {
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "seq::deserialize"
    )]
    pub annotations: Vec<AnnotationInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAnnotation {
    pub annotation: AnnotationRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAnnotationSubtype {
    pub subtype: AnnotationSubtype,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAnnotationRect {
    pub rect: Rect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseAnnotation {}

// Bookmarks

/// `None` when there is no such bookmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetFirstChildBookmark {
    pub bookmark: Option<BookmarkRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetNextSiblingBookmark {
    pub bookmark: Option<BookmarkRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBookmarkTitle {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBookmarks {
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "seq::deserialize"
    )]
    pub bookmarks: Vec<BookmarkNode>,
}

// Attachments

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAttachmentCount {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAttachment {
    pub attachment: AttachmentRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAttachmentName {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAttachmentFile {
    pub output: Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAttachments {
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "seq::deserialize"
    )]
    pub attachments: Vec<AttachmentInfo>,
}

// Bitmaps

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBitmap {
    pub bitmap: BitmapRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRect {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBitmapInfo {
    pub info: BitmapInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBitmapBuffer {
    pub info: BitmapInfo,
    pub output: Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyBitmap {}

// Rendering

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPageBitmap {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPage {
    pub info: BitmapInfo,
    pub output: Output,
}

// Progressive rendering

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRender {
    pub page: PageRef,
    pub state: RenderState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinueRender {
    pub state: RenderState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRender {
    pub state: RenderState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRenderState {
    pub state: RenderState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_collections_decode_from_null_and_absent() {
        for json in [r#"{}"#, r#"{"annotations":null}"#, r#"{"annotations":[]}"#] {
            let response: GetAnnotations = serde_json::from_str(json).unwrap();
            assert!(response.annotations.is_empty());
        }

        let response: GetBookmarks = serde_json::from_str(r#"{"bookmarks":null}"#).unwrap();
        assert!(response.bookmarks.is_empty());

        let response: GetAttachments = serde_json::from_str(r#"{}"#).unwrap();
        assert!(response.attachments.is_empty());
    }

    #[test]
    fn test_empty_collections_are_omitted() {
        let json = serde_json::to_string(&GetAnnotations {
            annotations: Vec::new(),
        })
        .unwrap();
        assert_eq!(json, "{}");
    }
}
