//! Progressive render controller
//!
//! Tracks pausable renders per page inside one worker session.
//!
//! ```text
//!                 start            pause
//!   NotStarted ─────────▶ Rendering ◀────▶ Paused
//!                             │     resume
//!                             ▼ done
//!                            Done
//!
//!   close: any state ─▶ Closed
//! ```
//!
//! At most one render is active (`Rendering` or `Paused`) per page.
//! Starting again after `Done` or `Closed` is allowed. The controller only
//! decides transitions; the session issues the native calls and reports
//! back through [`ProgressiveRenders::settle`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::protocol::types::RenderStatus;
use crate::references::Reference;

/// State of a progressive render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderState {
    NotStarted,
    Rendering,
    Paused,
    Done,
    Closed,
}

impl RenderState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Rendering | Self::Paused)
    }

    /// Whether the engine holds a render context in this state
    fn holds_context(&self) -> bool {
        matches!(self, Self::Rendering | Self::Paused | Self::Done)
    }
}

#[derive(Debug, Clone)]
struct ProgressiveRender {
    bitmap: Reference,
    state: RenderState,
}

/// Progressive renders of one session, keyed by page
#[derive(Debug, Default)]
pub struct ProgressiveRenders {
    entries: HashMap<Reference, ProgressiveRender>,
}

fn invalid(page: Reference, state: RenderState, action: &str) -> DispatchError {
    DispatchError::InvalidState(format!("cannot {action} render of {page} while {state:?}"))
}

impl ProgressiveRenders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, page: Reference) -> RenderState {
        self.entries
            .get(&page)
            .map(|entry| entry.state)
            .unwrap_or(RenderState::NotStarted)
    }

    /// Enter `Rendering` for a fresh render into `bitmap`
    ///
    /// Returns `true` when a finished render still holds an engine context
    /// that must be closed before starting over.
    pub fn begin(&mut self, page: Reference, bitmap: Reference) -> Result<bool> {
        let previous = self.state(page);
        if previous.is_active() {
            return Err(invalid(page, previous, "start"));
        }
        self.entries.insert(
            page,
            ProgressiveRender {
                bitmap,
                state: RenderState::Rendering,
            },
        );
        Ok(previous.holds_context())
    }

    /// `Paused` to `Rendering`
    pub fn resume(&mut self, page: Reference) -> Result<()> {
        let state = self.state(page);
        match self.entries.get_mut(&page) {
            Some(entry) if state == RenderState::Paused => {
                entry.state = RenderState::Rendering;
                Ok(())
            }
            _ => Err(invalid(page, state, "resume")),
        }
    }

    /// Record what the engine returned for a `Rendering` step
    pub fn settle(&mut self, page: Reference, status: RenderStatus) -> Result<RenderState> {
        let state = self.state(page);
        let Some(entry) = self.entries.get_mut(&page).filter(|_| state == RenderState::Rendering)
        else {
            return Err(invalid(page, state, "settle"));
        };
        entry.state = match status {
            RenderStatus::ToBeContinued => RenderState::Paused,
            RenderStatus::Done => RenderState::Done,
        };
        Ok(entry.state)
    }

    /// Mark a failed step; the session has released the context
    pub fn fail(&mut self, page: Reference) {
        if let Some(entry) = self.entries.get_mut(&page) {
            entry.state = RenderState::Closed;
        }
    }

    /// Move to `Closed` from any state
    ///
    /// Returns `true` when the engine context must be released.
    pub fn close(&mut self, page: Reference) -> bool {
        match self.entries.get_mut(&page) {
            Some(entry) => {
                let had_context = entry.state.holds_context();
                entry.state = RenderState::Closed;
                had_context
            }
            None => {
                self.entries.insert(
                    page,
                    ProgressiveRender {
                        bitmap: page,
                        state: RenderState::Closed,
                    },
                );
                false
            }
        }
    }

    /// Drop the entry of a released page
    ///
    /// Returns `true` when the engine context must be released first.
    pub fn forget(&mut self, page: Reference) -> bool {
        self.entries
            .remove(&page)
            .is_some_and(|entry| entry.state.holds_context())
    }

    /// Pages whose live render targets `bitmap`
    pub fn pages_rendering_into(&self, bitmap: Reference) -> Vec<Reference> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.bitmap == bitmap && entry.state.holds_context())
            .map(|(page, _)| *page)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state.is_active())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::references::ReferenceKind;

    fn refs() -> (Reference, Reference) {
        let doc = Reference::generate(ReferenceKind::Document, None);
        (
            Reference::generate(ReferenceKind::Page, Some(doc.scope())),
            Reference::generate(ReferenceKind::Bitmap, Some(doc.scope())),
        )
    }

    #[test]
    fn test_pause_resume_done() {
        let (page, bitmap) = refs();
        let mut renders = ProgressiveRenders::new();
        assert_eq!(renders.state(page), RenderState::NotStarted);

        assert!(!renders.begin(page, bitmap).unwrap());
        assert_eq!(
            renders.settle(page, RenderStatus::ToBeContinued).unwrap(),
            RenderState::Paused
        );
        renders.resume(page).unwrap();
        assert_eq!(
            renders.settle(page, RenderStatus::Done).unwrap(),
            RenderState::Done
        );
        assert_eq!(renders.active_count(), 0);
    }

    #[test]
    fn test_second_start_while_active_fails() {
        let (page, bitmap) = refs();
        let mut renders = ProgressiveRenders::new();
        renders.begin(page, bitmap).unwrap();
        renders.settle(page, RenderStatus::ToBeContinued).unwrap();

        let err = renders.begin(page, bitmap).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
    }

    #[test]
    fn test_close_from_paused_then_resume_fails() {
        let (page, bitmap) = refs();
        let mut renders = ProgressiveRenders::new();
        renders.begin(page, bitmap).unwrap();
        renders.settle(page, RenderStatus::ToBeContinued).unwrap();

        assert!(renders.close(page));
        assert_eq!(renders.state(page), RenderState::Closed);
        assert!(renders.resume(page).is_err());
        assert!(!renders.close(page));
    }

    #[test]
    fn test_restart_after_done_reports_stale_context() {
        let (page, bitmap) = refs();
        let mut renders = ProgressiveRenders::new();
        renders.begin(page, bitmap).unwrap();
        renders.settle(page, RenderStatus::Done).unwrap();

        assert!(renders.begin(page, bitmap).unwrap());
    }

    #[test]
    fn test_close_before_start_is_allowed() {
        let (page, _) = refs();
        let mut renders = ProgressiveRenders::new();
        assert!(!renders.close(page));
        assert_eq!(renders.state(page), RenderState::Closed);
    }

    #[test]
    fn test_resume_without_pause_fails() {
        let (page, bitmap) = refs();
        let mut renders = ProgressiveRenders::new();
        assert!(renders.resume(page).is_err());
        renders.begin(page, bitmap).unwrap();
        assert!(renders.resume(page).is_err());
    }

    #[test]
    fn test_bitmap_lookup_and_forget() {
        let (page, bitmap) = refs();
        let mut renders = ProgressiveRenders::new();
        renders.begin(page, bitmap).unwrap();
        renders.settle(page, RenderStatus::ToBeContinued).unwrap();

        assert_eq!(renders.pages_rendering_into(bitmap), vec![page]);
        assert!(renders.forget(page));
        assert_eq!(renders.state(page), RenderState::NotStarted);
    }
}
