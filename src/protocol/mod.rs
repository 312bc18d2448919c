//! Typed request/response catalogue
//!
//! Every native operation has exactly one request struct in [`requests`]
//! and one response struct in [`responses`], tied together by the [`Call`]
//! trait. The [`Request`] and [`Response`] enums carry them through the
//! dispatcher, worker channels and the process wire.
//!
//! ```text
//!   requests::GetPageCount ──into──▶ Request::GetPageCount
//!                                          │ worker
//!   responses::GetPageCount ◀──from── Response::GetPageCount
//! ```
//!
//! Requests are routed by the references they carry: every reference holds
//! the id of its document scope, so [`Request::route`] finds the owning
//! worker without consulting any worker state.

pub mod requests;
pub mod responses;
pub mod types;
pub mod wire;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::references::Reference;

pub use types::*;

/// Where a request has to go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Opens a new document; needs a worker from the pool
    Open,
    /// Targets the worker owning this document scope
    Scope(Uuid),
}

/// References carried by a request
pub trait Targets {
    fn references(&self) -> Vec<Reference>;
}

/// Typed request with its paired response
pub trait Call: Into<Request> {
    type Output;

    const OPERATION: Operation;

    /// Extract the paired response
    fn from_response(response: Response) -> Result<Self::Output>;
}

/// Caller supplied "should pause now" predicate for progressive renders
///
/// Never crosses a process boundary; it is skipped when serializing.
pub struct PausePredicate(Box<dyn FnMut() -> bool + Send>);

impl PausePredicate {
    pub fn new(predicate: impl FnMut() -> bool + Send + 'static) -> Self {
        Self(Box::new(predicate))
    }

    /// Always keep going
    pub fn never() -> Self {
        Self::new(|| false)
    }

    /// Pause the first `times` times the engine asks, then run to completion
    pub fn times(times: usize) -> Self {
        let mut left = times;
        Self::new(move || {
            if left == 0 {
                return false;
            }
            left -= 1;
            true
        })
    }

    pub fn should_pause(&mut self) -> bool {
        (self.0)()
    }
}

impl fmt::Debug for PausePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PausePredicate(..)")
    }
}

macro_rules! catalogue {
    ($($op:ident,)+) => {
        /// Any request in the catalogue
        #[derive(Debug, Serialize, Deserialize)]
        pub enum Request {
            $($op(requests::$op),)+
        }

        /// Any response in the catalogue
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Response {
            $($op(responses::$op),)+
        }

        /// Operation names
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Operation {
            $($op,)+
        }

        impl Operation {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$op => stringify!($op),)+
                }
            }
        }

        impl Request {
            pub fn operation(&self) -> Operation {
                match self {
                    $(Self::$op(_) => Operation::$op,)+
                }
            }

            /// Every reference the request carries
            pub fn references(&self) -> Vec<Reference> {
                match self {
                    $(Self::$op(request) => request.references(),)+
                }
            }
        }

        impl Response {
            pub fn operation(&self) -> Operation {
                match self {
                    $(Self::$op(_) => Operation::$op,)+
                }
            }
        }

        $(
            impl From<requests::$op> for Request {
                fn from(request: requests::$op) -> Self {
                    Self::$op(request)
                }
            }

            impl From<responses::$op> for Response {
                fn from(response: responses::$op) -> Self {
                    Self::$op(response)
                }
            }

            impl Call for requests::$op {
                type Output = responses::$op;

                const OPERATION: Operation = Operation::$op;

                fn from_response(response: Response) -> Result<Self::Output> {
                    match response {
                        Response::$op(output) => Ok(output),
                        other => Err(mismatch(Operation::$op, other.operation())),
                    }
                }
            }
        )+
    };
}

catalogue! {
    OpenDocument,
    CreateDocument,
    CloseDocument,
    GetPageCount,
    GetFileVersion,
    GetDocPermissions,
    GetMetadata,
    SaveAsCopy,
    LoadPage,
    ClosePage,
    GetPageSize,
    GetPageRotation,
    SetPageRotation,
    FlattenPage,
    LoadTextPage,
    CloseTextPage,
    CountChars,
    GetText,
    GetCharBox,
    GetPageText,
    FindStart,
    FindNext,
    FindPrev,
    GetSearchResult,
    FindClose,
    GetAnnotationCount,
    GetAnnotation,
    GetAnnotations,
    CreateAnnotation,
    GetAnnotationSubtype,
    GetAnnotationRect,
    CloseAnnotation,
    GetFirstChildBookmark,
    GetNextSiblingBookmark,
    GetBookmarkTitle,
    GetBookmarks,
    GetAttachmentCount,
    GetAttachment,
    GetAttachmentName,
    GetAttachmentFile,
    GetAttachments,
    CreateBitmap,
    FillRect,
    GetBitmapInfo,
    GetBitmapBuffer,
    DestroyBitmap,
    RenderPageBitmap,
    RenderPage,
    StartRender,
    ContinueRender,
    CloseRender,
    GetRenderState,
}

fn mismatch(expected: Operation, got: Operation) -> DispatchError {
    DispatchError::WorkerUnavailable(format!(
        "protocol mismatch: {} answered with {}",
        expected, got
    ))
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Request {
    /// Find the worker scope this request belongs to
    ///
    /// All references in one request must come from the same document.
    pub fn route(&self) -> Result<Route> {
        if matches!(self, Self::OpenDocument(_) | Self::CreateDocument(_)) {
            return Ok(Route::Open);
        }

        let references = self.references();
        let mut scopes = references.iter().map(|r| r.scope());
        let Some(scope) = scopes.next() else {
            return Err(DispatchError::InvalidRequest(format!(
                "{} carries no reference",
                self.operation()
            )));
        };
        if scopes.any(|other| other != scope) {
            return Err(DispatchError::InvalidReference(format!(
                "{} mixes references from different documents",
                self.operation()
            )));
        }
        Ok(Route::Scope(scope))
    }

    /// Whether the request holds a pause predicate
    pub fn has_pause_predicate(&self) -> bool {
        match self {
            Self::StartRender(request) => request.pause.is_some(),
            Self::ContinueRender(request) => request.pause.is_some(),
            _ => false,
        }
    }
}
