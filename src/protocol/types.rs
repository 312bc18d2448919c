//! Value types shared by requests, responses and the engine seam

use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::references::{AnnotationRef, AttachmentRef, BookmarkRef, DocumentRef, PageRef};

/// Rectangle in page space (points)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).abs()
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).abs()
    }
}

/// Page dimensions in points
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

/// Page rotation in quarter turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    CounterClockwise90,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Self::None => 0,
            Self::Clockwise90 => 90,
            Self::Rotate180 => 180,
            Self::CounterClockwise90 => 270,
        }
    }

    /// Normalize any multiple of 90 degrees
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::None),
            90 => Some(Self::Clockwise90),
            180 => Some(Self::Rotate180),
            270 => Some(Self::CounterClockwise90),
            _ => None,
        }
    }
}

/// Address of a page: by index within a document, or by a loaded page
///
/// Both forms resolve to the same native page inside a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSelector {
    ByIndex { document: DocumentRef, index: usize },
    ByReference(PageRef),
}

impl PageSelector {
    pub fn by_index(document: DocumentRef, index: usize) -> Self {
        Self::ByIndex { document, index }
    }
}

impl From<PageRef> for PageSelector {
    fn from(page: PageRef) -> Self {
        Self::ByReference(page)
    }
}

/// Document permission bits as stored in the encryption dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const PRINT: u32 = 1 << 2;
    pub const MODIFY: u32 = 1 << 3;
    pub const COPY: u32 = 1 << 4;
    pub const ANNOTATE: u32 = 1 << 5;
    pub const FILL_FORMS: u32 = 1 << 8;
    pub const ASSEMBLE: u32 = 1 << 10;

    /// Everything allowed (unencrypted document)
    pub fn all() -> Self {
        Self(u32::MAX)
    }

    pub fn allows(&self, bit: u32) -> bool {
        self.0 & bit == bit
    }
}

/// Document information dictionary keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataTag {
    Title,
    Author,
    Subject,
    Keywords,
    Creator,
    Producer,
    CreationDate,
    ModDate,
}

impl MetadataTag {
    pub const ALL: [MetadataTag; 8] = [
        Self::Title,
        Self::Author,
        Self::Subject,
        Self::Keywords,
        Self::Creator,
        Self::Producer,
        Self::CreationDate,
        Self::ModDate,
    ];
}

impl fmt::Display for MetadataTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How `SaveAsCopy` writes the document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    #[default]
    Full,
    Incremental,
    RemoveSecurity,
}

/// What `FlattenPage` bakes into the page content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlattenMode {
    #[default]
    Display,
    Print,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlattenResult {
    Failed,
    Success,
    NothingToDo,
}

/// Text search options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFlags {
    #[serde(default)]
    pub match_case: bool,
    #[serde(default)]
    pub match_whole_word: bool,
    #[serde(default)]
    pub consecutive: bool,
}

/// Position of the current search hit in the text page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub char_index: usize,
    pub count: usize,
}

/// Annotation subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationSubtype {
    Unknown,
    Text,
    Link,
    FreeText,
    Line,
    Square,
    Circle,
    Polygon,
    Polyline,
    Highlight,
    Underline,
    Squiggly,
    Strikeout,
    Stamp,
    Caret,
    Ink,
    Popup,
    FileAttachment,
    Sound,
    Movie,
    Widget,
    Screen,
    PrinterMark,
    TrapNet,
    Watermark,
    ThreeD,
    RichMedia,
    XfaWidget,
    Redact,
}

impl AnnotationSubtype {
    /// Subtypes that can be created through `CreateAnnotation`
    pub fn is_creatable(&self) -> bool {
        matches!(
            self,
            Self::Circle
                | Self::FileAttachment
                | Self::FreeText
                | Self::Highlight
                | Self::Ink
                | Self::Link
                | Self::Popup
                | Self::Square
                | Self::Squiggly
                | Self::Stamp
                | Self::Strikeout
                | Self::Text
                | Self::Underline
        )
    }
}

/// One annotation as returned by `GetAnnotations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationInfo {
    pub annotation: AnnotationRef,
    pub index: usize,
    pub subtype: AnnotationSubtype,
    pub rect: Rect,
}

/// One outline entry with its subtree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkNode {
    pub bookmark: BookmarkRef,
    pub title: String,
    pub page_index: Option<usize>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "super::wire::seq::deserialize"
    )]
    pub children: Vec<BookmarkNode>,
}

/// One embedded file as returned by `GetAttachments`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub attachment: AttachmentRef,
    pub index: usize,
    pub name: String,
}

/// Pixel layout of a bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitmapFormat {
    Gray,
    Bgr,
    Bgrx,
    #[default]
    Bgra,
}

impl BitmapFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Bgr => 3,
            Self::Bgrx | Self::Bgra => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapInfo {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: BitmapFormat,
}

impl BitmapInfo {
    /// Largest pixel buffer a bitmap may own (1 GiB)
    pub const MAX_BYTES: usize = 1 << 30;

    pub fn new(width: u32, height: u32, format: BitmapFormat) -> Self {
        Self {
            width,
            height,
            stride: width as usize * format.bytes_per_pixel(),
            format,
        }
    }

    /// Layout of a `width` x `height` bitmap, if it is non-empty and its
    /// buffer stays within [`BitmapInfo::MAX_BYTES`]
    pub fn checked(width: u32, height: u32, format: BitmapFormat) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let stride = (width as usize).checked_mul(format.bytes_per_pixel())?;
        let len = stride.checked_mul(height as usize)?;
        if len > Self::MAX_BYTES {
            return None;
        }
        Some(Self {
            width,
            height,
            stride,
            format,
        })
    }

    pub fn buffer_len(&self) -> usize {
        self.stride * self.height as usize
    }
}

/// RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
        a: 255,
    };

    /// Pixel bytes in `format` order
    pub fn to_pixel(&self, format: BitmapFormat) -> Vec<u8> {
        match format {
            BitmapFormat::Gray => {
                let luma = (self.r as u32 * 299 + self.g as u32 * 587 + self.b as u32 * 114) / 1000;
                vec![luma as u8]
            }
            BitmapFormat::Bgr => vec![self.b, self.g, self.r],
            BitmapFormat::Bgrx => vec![self.b, self.g, self.r, 255],
            BitmapFormat::Bgra => vec![self.b, self.g, self.r, self.a],
        }
    }
}

/// Device-space rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    /// Column and row ranges of the rectangle inside a `width` x `height` bitmap
    pub fn clip(&self, width: u32, height: u32) -> (Range<usize>, Range<usize>) {
        let span = |start: i32, extent: i32, limit: u32| {
            let limit = i32::try_from(limit).unwrap_or(i32::MAX);
            let from = start.clamp(0, limit) as usize;
            let to = start.saturating_add(extent).clamp(0, limit) as usize;
            from..to.max(from)
        };
        (
            span(self.left, self.width, width),
            span(self.top, self.height, height),
        )
    }
}

/// Placement of the page inside the target bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub start_x: i32,
    pub start_y: i32,
    pub size_x: i32,
    pub size_y: i32,
}

impl Viewport {
    /// Page stretched over the whole bitmap
    pub fn full(info: &BitmapInfo) -> Self {
        Self {
            start_x: 0,
            start_y: 0,
            size_x: info.width as i32,
            size_y: info.height as i32,
        }
    }
}

/// Render options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderFlags {
    #[serde(default)]
    pub annotations: bool,
    #[serde(default)]
    pub lcd_text: bool,
    #[serde(default)]
    pub grayscale: bool,
    #[serde(default)]
    pub printing: bool,
}

/// Engine status after a progressive render step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    ToBeContinued,
    Done,
}

/// Where an exported artifact is delivered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    #[default]
    Bytes,
    File { path: PathBuf },
}

/// Delivered artifact; the variant reports the mode used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    Bytes(Vec<u8>),
    File { path: PathBuf, size: u64 },
}

impl Output {
    /// Deliver `data` to `target`
    pub fn deliver(target: &OutputTarget, data: Vec<u8>) -> std::io::Result<Self> {
        match target {
            OutputTarget::Bytes => Ok(Self::Bytes(data)),
            OutputTarget::File { path } => {
                std::fs::write(path, &data)?;
                Ok(Self::File {
                    path: path.clone(),
                    size: data.len() as u64,
                })
            }
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(data) => data.len() as u64,
            Self::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
