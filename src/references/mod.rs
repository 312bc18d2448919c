//! Opaque references to native objects
//!
//! A [`Reference`] stands in for a native handle outside the worker that
//! owns it. It is a pair of UUIDs: the object id and the id of the document
//! scope the object lives in. The scope lets the dispatcher route any
//! reference to the worker owning its document without asking that worker.
//!
//! Typed wrappers ([`DocumentRef`], [`PageRef`], ...) are what the request
//! catalogue uses. The registry re-checks the kind on every lookup, so a
//! forged or mis-typed value is rejected instead of reaching the engine.

mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use registry::{Registry, RegistryError, Released};

/// Kind of native object a reference points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Document,
    Page,
    Bitmap,
    Annotation,
    Attachment,
    Bookmark,
    Action,
    Destination,
    Link,
    TextPage,
    SearchHandle,
    FormHandle,
    StructTree,
    StructElement,
    StructElementAttr,
    ClipPath,
    PathSegment,
    XObject,
    PageObject,
    JavaScriptAction,
    Signature,
    AvailabilityProvider,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Page => "page",
            Self::Bitmap => "bitmap",
            Self::Annotation => "annotation",
            Self::Attachment => "attachment",
            Self::Bookmark => "bookmark",
            Self::Action => "action",
            Self::Destination => "destination",
            Self::Link => "link",
            Self::TextPage => "text_page",
            Self::SearchHandle => "search_handle",
            Self::FormHandle => "form_handle",
            Self::StructTree => "struct_tree",
            Self::StructElement => "struct_element",
            Self::StructElementAttr => "struct_element_attr",
            Self::ClipPath => "clip_path",
            Self::PathSegment => "path_segment",
            Self::XObject => "xobject",
            Self::PageObject => "page_object",
            Self::JavaScriptAction => "javascript_action",
            Self::Signature => "signature",
            Self::AvailabilityProvider => "availability_provider",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untyped reference value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    kind: ReferenceKind,
    scope: Uuid,
    id: Uuid,
}

impl Reference {
    /// Fresh reference; a document reference is its own scope
    pub(crate) fn generate(kind: ReferenceKind, scope: Option<Uuid>) -> Self {
        let id = Uuid::new_v4();
        Self {
            kind,
            scope: scope.unwrap_or(id),
            id,
        }
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    /// Id of the document scope this reference belongs to
    pub fn scope(&self) -> Uuid {
        self.scope
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Reference wrapper bound to one [`ReferenceKind`]
pub trait TypedReference: Copy + Into<Reference> {
    const KIND: ReferenceKind;

    /// Wrap `reference` if it has this wrapper's kind
    fn wrap(reference: Reference) -> Option<Self>;
}

macro_rules! typed_reference {
    ($($(#[$meta:meta])* $name:ident => $kind:ident;)+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Reference);

            impl TypedReference for $name {
                const KIND: ReferenceKind = ReferenceKind::$kind;

                fn wrap(reference: Reference) -> Option<Self> {
                    (reference.kind == Self::KIND).then_some(Self(reference))
                }
            }

            impl $name {
                /// Wrap an untyped reference, checking its kind
                pub fn from_reference(reference: Reference) -> Option<Self> {
                    <Self as TypedReference>::wrap(reference)
                }

                pub fn reference(&self) -> Reference {
                    self.0
                }

                pub fn scope(&self) -> Uuid {
                    self.0.scope
                }
            }

            impl From<$name> for Reference {
                fn from(value: $name) -> Self {
                    value.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }
        )+
    };
}

typed_reference! {
    /// An open document
    DocumentRef => Document;
    /// A loaded page
    PageRef => Page;
    /// A device independent bitmap
    BitmapRef => Bitmap;
    /// A page annotation
    AnnotationRef => Annotation;
    /// An embedded file
    AttachmentRef => Attachment;
    /// An outline entry
    BookmarkRef => Bookmark;
    /// A link or bookmark action
    ActionRef => Action;
    /// A named or explicit destination
    DestinationRef => Destination;
    /// A page link
    LinkRef => Link;
    /// Text layer of a loaded page
    TextPageRef => TextPage;
    /// An in-progress text search
    SearchHandleRef => SearchHandle;
    /// Interactive form environment
    FormHandleRef => FormHandle;
    /// Tagged structure tree of a page
    StructTreeRef => StructTree;
    /// Element of a structure tree
    StructElementRef => StructElement;
    /// Attribute object of a structure element
    StructElementAttrRef => StructElementAttr;
    /// Clip path of a page object
    ClipPathRef => ClipPath;
    /// Segment of a path object
    PathSegmentRef => PathSegment;
    /// Form XObject imported from another document
    XObjectRef => XObject;
    /// Object in a page's content
    PageObjectRef => PageObject;
    /// Document level JavaScript action
    JavaScriptActionRef => JavaScriptAction;
    /// Digital signature
    SignatureRef => Signature;
    /// Progressive loading availability provider
    AvailabilityProviderRef => AvailabilityProvider;
}
