#![forbid(unsafe_code)]

//! Computation context.
//!
//! The context is the "currently computing" slot used to attribute reads to
//! the entry being computed. It is kept as a stack of in-flight entries: the
//! top is the current slot, the rest are the saved previous contexts. Keeping
//! the whole chain lets a read detect re-entry of *any* in-flight entry
//! (A reads B reads A), not only the innermost one.
//!
//! # Discipline
//!
//! - Every computation enters through [`ComputationContext::enter`] and leaves
//!   through [`Frame::finish`], which restores the previous context.
//! - Any failure clears the whole stack. A [`Frame`] dropped without
//!   `finish()` (early return or unwinding panic) also clears it, so a failed
//!   computation never leaves a half-popped context behind.

use std::cell::RefCell;

use crate::store::EntryId;

#[derive(Debug, Default)]
pub(crate) struct ComputationContext {
    stack: RefCell<Vec<EntryId>>,
}

impl ComputationContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Entry currently being computed, if any.
    pub(crate) fn current(&self) -> Option<EntryId> {
        self.stack.borrow().last().copied()
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.stack.borrow().is_empty()
    }

    /// Whether `id` is anywhere in the in-flight chain.
    pub(crate) fn contains(&self, id: EntryId) -> bool {
        self.stack.borrow().contains(&id)
    }

    pub(crate) fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    pub(crate) fn clear(&self) {
        self.stack.borrow_mut().clear();
    }

    /// Make `id` the current context until the returned frame finishes.
    pub(crate) fn enter(&self, id: EntryId) -> Frame<'_> {
        let mut stack = self.stack.borrow_mut();
        let saved = stack.len();
        stack.push(id);
        Frame {
            context: self,
            saved,
            finished: false,
        }
    }
}

/// One pushed context. Finish it to restore the previous context.
#[must_use = "a frame dropped without finish() clears the whole context"]
pub(crate) struct Frame<'a> {
    context: &'a ComputationContext,
    saved: usize,
    finished: bool,
}

impl Frame<'_> {
    /// Restore the context that was current before this frame.
    pub(crate) fn finish(mut self) {
        self.context.stack.borrow_mut().truncate(self.saved);
        self.finished = true;
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.context.clear();
        }
    }
}
