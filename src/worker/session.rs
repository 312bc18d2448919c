//! Worker session state
//!
//! One [`Session`] per worker: the engine instance, the reference registry
//! for everything the engine has handed out, the page index used to
//! canonicalize page addresses, and the progressive render table.
//!
//! A session is only ever touched by its worker's thread, one request at a
//! time, so none of this state is locked.

use std::collections::HashMap;

use crate::engine::{NativeEngine, NativeFailure, NativeResult, RawHandle};
use crate::error::{DispatchError, Result};
use crate::progressive::ProgressiveRenders;
use crate::protocol::types::PageSelector;
use crate::protocol::Response;
use crate::references::{Reference, ReferenceKind, Registry, TypedReference};

/// Where a derived object was reached from
///
/// Repeated lookups through the same origin return the reference handed out
/// the first time instead of registering a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum Origin {
    Annotation { page: Reference, index: usize },
    Attachment { document: Reference, index: usize },
    FirstChild { document: Reference, parent: Option<Reference> },
    NextSibling { bookmark: Reference },
}

pub struct Session {
    pub(super) engine: Box<dyn NativeEngine>,
    pub(super) registry: Registry<RawHandle>,
    pub(super) renders: ProgressiveRenders,
    /// (document, index) -> loaded page
    pages: HashMap<(Reference, usize), Reference>,
    page_slots: HashMap<Reference, (Reference, usize)>,
    derived: HashMap<Origin, Reference>,
    origins: HashMap<Reference, Origin>,
    /// Name of the operation being executed, for error reports
    pub(super) operation: &'static str,
    fatal: Option<String>,
}

/// Wrap a registry reference in its typed form
pub(super) fn typed<R: TypedReference>(reference: Reference) -> Result<R> {
    R::wrap(reference).ok_or_else(|| {
        DispatchError::InvalidReference(format!("{reference} is not a {}", R::KIND))
    })
}

impl Session {
    pub fn new(engine: Box<dyn NativeEngine>) -> Self {
        Self {
            engine,
            registry: Registry::new(),
            renders: ProgressiveRenders::new(),
            pages: HashMap::new(),
            page_slots: HashMap::new(),
            derived: HashMap::new(),
            origins: HashMap::new(),
            operation: "",
            fatal: None,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Reason the engine became unusable, if it did
    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub(super) fn mark_fatal(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(engine = self.engine.name(), reason = %reason, "native engine is unusable");
        self.fatal.get_or_insert(reason);
    }

    /// Run one native call, converting its failure
    pub(super) fn call<T>(
        &mut self,
        f: impl FnOnce(&mut dyn NativeEngine) -> NativeResult<T>,
    ) -> Result<T> {
        f(self.engine.as_mut()).map_err(|failure| self.failed(failure))
    }

    fn failed(&mut self, failure: NativeFailure) -> DispatchError {
        if let NativeFailure::Fatal(reason) = &failure {
            self.mark_fatal(reason.clone());
        }
        failure.into_dispatch(self.operation)
    }

    /// Resolve a typed reference, checking its kind
    pub(super) fn resolve<R: TypedReference>(&self, reference: R) -> Result<RawHandle> {
        Ok(self.registry.resolve_kind(reference.into(), R::KIND)?)
    }

    /// Register a fresh native object, closing it again if that fails
    pub(super) fn adopt(
        &mut self,
        kind: ReferenceKind,
        parent: Option<Reference>,
        handle: RawHandle,
    ) -> Result<Reference> {
        match self.registry.register(kind, parent, handle) {
            Ok(reference) => Ok(reference),
            Err(err) => {
                self.close_native(kind, None, handle);
                Err(err.into())
            }
        }
    }

    /// Canonical page for a selector, loading it when addressed by index
    pub(super) fn page(&mut self, selector: PageSelector) -> Result<(Reference, RawHandle)> {
        match selector {
            PageSelector::ByReference(page) => Ok((page.reference(), self.resolve(page)?)),
            PageSelector::ByIndex { document, index } => {
                let document_handle = self.resolve(document)?;
                self.load_page(document.reference(), document_handle, index)
            }
        }
    }

    /// Canonical page for a selector without loading anything
    pub(super) fn find_page(&self, selector: PageSelector) -> Result<Option<Reference>> {
        match selector {
            PageSelector::ByReference(page) => {
                self.resolve(page)?;
                Ok(Some(page.reference()))
            }
            PageSelector::ByIndex { document, index } => {
                self.resolve(document)?;
                Ok(self.pages.get(&(document.reference(), index)).copied())
            }
        }
    }

    /// Load page `index` once; later loads return the same reference
    pub(super) fn load_page(
        &mut self,
        document: Reference,
        document_handle: RawHandle,
        index: usize,
    ) -> Result<(Reference, RawHandle)> {
        if let Some(page) = self.pages.get(&(document, index)).copied() {
            return Ok((page, self.registry.resolve(page)?));
        }

        let handle = self.call(|engine| engine.load_page(document_handle, index))?;
        let page = self.adopt(ReferenceKind::Page, Some(document), handle)?;
        self.pages.insert((document, index), page);
        self.page_slots.insert(page, (document, index));
        Ok((page, handle))
    }

    /// Reference already handed out for `origin`, if still registered
    pub(super) fn derived(&self, origin: Origin) -> Option<(Reference, RawHandle)> {
        let reference = *self.derived.get(&origin)?;
        let handle = self.registry.resolve(reference).ok()?;
        Some((reference, handle))
    }

    /// [`Session::adopt`], remembering the origin for later lookups
    pub(super) fn adopt_derived(
        &mut self,
        origin: Origin,
        kind: ReferenceKind,
        parent: Option<Reference>,
        handle: RawHandle,
    ) -> Result<Reference> {
        let reference = self.adopt(kind, parent, handle)?;
        self.derived.insert(origin, reference);
        self.origins.insert(reference, origin);
        Ok(reference)
    }

    /// Stop reusing references reached through origins matching `stale`
    pub(super) fn forget_origins(&mut self, stale: impl Fn(&Origin) -> bool) {
        self.derived.retain(|origin, _| !stale(origin));
        self.origins.retain(|_, origin| !stale(origin));
    }

    #[cfg(test)]
    pub(super) fn reference_count(&self) -> usize {
        self.registry.len()
    }

    /// Release `reference` and everything derived from it
    ///
    /// Native objects are closed children first. Close failures are logged
    /// and do not stop the cascade.
    pub fn release(&mut self, reference: Reference) {
        for released in self.registry.release(reference) {
            if let Some(handle) = released.handle {
                self.close_native(released.reference.kind(), Some(released.reference), handle);
            }
        }
    }

    /// Close every open document
    pub fn release_all(&mut self) {
        for released in self.registry.drain() {
            if let Some(handle) = released.handle {
                self.close_native(released.reference.kind(), Some(released.reference), handle);
            }
        }
    }

    /// Undo a response that could not be delivered
    ///
    /// A document opened for a caller that already gave up would otherwise
    /// stay open with nobody holding its reference.
    pub fn discard(&mut self, response: &Response) {
        let document = match response {
            Response::OpenDocument(opened) => opened.document,
            Response::CreateDocument(created) => created.document,
            _ => return,
        };
        tracing::warn!(document = %document, "closing document of an undelivered reply");
        self.release(document.reference());
    }

    pub fn document_count(&self) -> usize {
        self.registry.count_kind(ReferenceKind::Document)
    }

    fn close_native(&mut self, kind: ReferenceKind, reference: Option<Reference>, handle: RawHandle) {
        if let Some(origin) = reference.and_then(|r| self.origins.remove(&r)) {
            self.derived.remove(&origin);
        }
        let result = match kind {
            ReferenceKind::Document => self.engine.close_document(handle),
            ReferenceKind::Page => {
                if let Some(page) = reference {
                    if self.renders.forget(page) {
                        if let Err(failure) = self.engine.render_close(handle) {
                            tracing::warn!(page = %page, error = %failure, "render close failed");
                        }
                    }
                    if let Some(slot) = self.page_slots.remove(&page) {
                        self.pages.remove(&slot);
                    }
                }
                self.engine.close_page(handle)
            }
            ReferenceKind::TextPage => self.engine.close_text_page(handle),
            ReferenceKind::SearchHandle => self.engine.find_close(handle),
            ReferenceKind::Annotation => self.engine.close_annotation(handle),
            ReferenceKind::Bitmap => {
                if let Some(bitmap) = reference {
                    for page in self.renders.pages_rendering_into(bitmap) {
                        self.renders.close(page);
                        if let Ok(page_handle) = self.registry.resolve(page) {
                            if let Err(failure) = self.engine.render_close(page_handle) {
                                tracing::warn!(page = %page, error = %failure, "render close failed");
                            }
                        }
                    }
                }
                self.engine.destroy_bitmap(handle)
            }
            // Borrowed from their document; nothing to close natively
            _ => Ok(()),
        };

        if let Err(failure) = result {
            tracing::warn!(kind = %kind, error = %failure, "native close failed");
            if let NativeFailure::Fatal(reason) = failure {
                self.mark_fatal(reason);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.fatal.is_none() {
            self.release_all();
        }
    }
}
