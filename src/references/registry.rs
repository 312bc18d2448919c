//! Reference registry
//!
//! Arena of live references for one worker session. Each entry records its
//! native handle and the reference it was derived from, so releasing a
//! document (or a page, or a text page) releases everything beneath it.
//!
//! The registry is owned by the worker's session and is only touched from
//! the worker's thread. It needs no locking of its own.
//!
//! ```text
//!   document ──┬── page ──┬── text page ── search handle
//!              │          └── annotation
//!              ├── bookmark
//!              └── bitmap
//! ```
//!
//! Reference ids are random UUIDs and are never handed out twice, so a
//! released value can not alias a newer handle.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use super::{Reference, ReferenceKind};
use crate::error::DispatchError;

/// Registry lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{0} not found, it was closed or belongs to another worker")]
    NotFound(Reference),

    #[error("{0} was allocated but never bound to a native handle")]
    Unbound(Reference),

    #[error("{0} is already bound")]
    AlreadyBound(Reference),

    #[error("expected a {expected} reference, got {found}")]
    KindMismatch {
        expected: ReferenceKind,
        found: Reference,
    },

    #[error("parent {0} is not live")]
    ParentNotLive(Reference),
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        DispatchError::InvalidReference(err.to_string())
    }
}

/// A reference removed by `release`, with the handle it was bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released<H> {
    pub reference: Reference,
    pub handle: Option<H>,
}

#[derive(Debug)]
struct Entry<H> {
    handle: Option<H>,
    parent: Option<Reference>,
    children: Vec<Reference>,
}

/// Arena mapping references to native handles
#[derive(Debug)]
pub struct Registry<H> {
    entries: HashMap<Reference, Entry<H>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H: Copy> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a reference of `kind` beneath `parent`
    ///
    /// Without a parent the reference opens its own scope.
    pub fn allocate(
        &mut self,
        kind: ReferenceKind,
        parent: Option<Reference>,
    ) -> Result<Reference, RegistryError> {
        let scope = match parent {
            Some(parent) => {
                let entry = self
                    .entries
                    .get(&parent)
                    .ok_or(RegistryError::ParentNotLive(parent))?;
                if entry.handle.is_none() {
                    return Err(RegistryError::ParentNotLive(parent));
                }
                Some(parent.scope())
            }
            None => None,
        };

        let reference = Reference::generate(kind, scope);
        self.entries.insert(
            reference,
            Entry {
                handle: None,
                parent,
                children: Vec::new(),
            },
        );
        if let Some(parent) = parent {
            if let Some(entry) = self.entries.get_mut(&parent) {
                entry.children.push(reference);
            }
        }

        Ok(reference)
    }

    /// Attach the native handle to an allocated reference
    pub fn bind(&mut self, reference: Reference, handle: H) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(&reference)
            .ok_or(RegistryError::NotFound(reference))?;
        if entry.handle.is_some() {
            return Err(RegistryError::AlreadyBound(reference));
        }
        entry.handle = Some(handle);
        Ok(())
    }

    /// Allocate and bind in one step
    pub fn register(
        &mut self,
        kind: ReferenceKind,
        parent: Option<Reference>,
        handle: H,
    ) -> Result<Reference, RegistryError> {
        let reference = self.allocate(kind, parent)?;
        self.bind(reference, handle)?;
        Ok(reference)
    }

    pub fn resolve(&self, reference: Reference) -> Result<H, RegistryError> {
        let entry = self
            .entries
            .get(&reference)
            .ok_or(RegistryError::NotFound(reference))?;
        entry.handle.ok_or(RegistryError::Unbound(reference))
    }

    /// Resolve, rejecting references of another kind
    pub fn resolve_kind(
        &self,
        reference: Reference,
        expected: ReferenceKind,
    ) -> Result<H, RegistryError> {
        if reference.kind() != expected {
            return Err(RegistryError::KindMismatch {
                expected,
                found: reference,
            });
        }
        self.resolve(reference)
    }

    pub fn contains(&self, reference: Reference) -> bool {
        self.entries.contains_key(&reference)
    }

    pub fn parent(&self, reference: Reference) -> Option<Reference> {
        self.entries.get(&reference).and_then(|entry| entry.parent)
    }

    /// Live children of `reference`
    pub fn children(&self, reference: Reference) -> &[Reference] {
        self.entries
            .get(&reference)
            .map(|entry| entry.children.as_slice())
            .unwrap_or(&[])
    }

    /// Live references of `kind`
    pub fn count_kind(&self, kind: ReferenceKind) -> usize {
        self.entries.keys().filter(|r| r.kind() == kind).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release `reference` and all of its descendants
    ///
    /// Descendants come first in the returned list (deepest first), the
    /// reference itself last. Releasing an unknown or already released
    /// reference returns an empty list.
    pub fn release(&mut self, reference: Reference) -> Vec<Released<H>> {
        let Some(parent) = self.entries.get(&reference).map(|entry| entry.parent) else {
            return Vec::new();
        };

        if let Some(parent) = parent {
            if let Some(entry) = self.entries.get_mut(&parent) {
                entry.children.retain(|child| *child != reference);
            }
        }

        let mut released = Vec::new();
        self.release_subtree(reference, &mut released);
        released
    }

    /// Release every reference whose scope is `scope`
    pub fn release_all(&mut self, scope: Uuid) -> Vec<Released<H>> {
        let roots: Vec<Reference> = self
            .entries
            .iter()
            .filter(|(reference, entry)| {
                reference.scope() == scope
                    && entry
                        .parent
                        .map(|parent| !self.entries.contains_key(&parent))
                        .unwrap_or(true)
            })
            .map(|(reference, _)| *reference)
            .collect();

        let mut released = Vec::new();
        for root in roots {
            released.extend(self.release(root));
        }
        released
    }

    /// Release everything, one scope at a time
    pub fn drain(&mut self) -> Vec<Released<H>> {
        let mut scopes: Vec<Uuid> = self.entries.keys().map(|r| r.scope()).collect();
        scopes.sort();
        scopes.dedup();

        let mut released = Vec::new();
        for scope in scopes {
            released.extend(self.release_all(scope));
        }
        released
    }

    fn release_subtree(&mut self, reference: Reference, out: &mut Vec<Released<H>>) {
        let Some(entry) = self.entries.remove(&reference) else {
            return;
        };
        for child in entry.children.iter().rev() {
            self.release_subtree(*child, out);
        }
        out.push(Released {
            reference,
            handle: entry.handle,
        });
    }
}
