/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! The per-pipe scope stack: nested frames of blockers and finishers.
//!
//! Entering a scope pushes a fresh frame; exiting pops it, and pops are
//! only allowed when the frame is empty. `select` and `busy`/`blocked`
//! only ever look at the *top* frame, which is what gives scopes their
//! isolation: a child tethered two scopes ago is invisible to `select`
//! called from inside a freshly entered scope.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::pipe::Pipe;

/// One level of the scope stack.
pub(crate) struct ScopeFrame {
    /// Saturating truncation-request counter for this frame.
    pub(crate) truncation: u64,
    /// Children whose worker is still running.
    pub(crate) blockers: Vec<Arc<Pipe>>,
    /// Children that have yielded, in the order they finished.
    pub(crate) finishers: VecDeque<Arc<Pipe>>,
}

impl ScopeFrame {
    fn new() -> Self {
        ScopeFrame {
            truncation: 0,
            blockers: Vec::new(),
            finishers: VecDeque::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blockers.is_empty() && self.finishers.is_empty()
    }
}

/// A pipe's stack of scope frames, outermost first.
pub(crate) struct ScopeStack(Vec<ScopeFrame>);

impl ScopeStack {
    /// Every pipe starts with exactly one (outermost) frame.
    pub(crate) fn new() -> Self {
        ScopeStack(vec![ScopeFrame::new()])
    }

    pub(crate) fn top(&self) -> &ScopeFrame {
        self.0.last().expect("scope stack is never empty")
    }

    pub(crate) fn top_mut(&mut self) -> &mut ScopeFrame {
        self.0.last_mut().expect("scope stack is never empty")
    }

    /// Number of enclosing frames of the current top frame; 0 at the
    /// outermost frame.
    pub(crate) fn level(&self) -> usize {
        self.0.len() - 1
    }

    /// The frame at `self.level() - back`, i.e. walking up `back` levels
    /// from the top. Used by the source-side yield protocol to find the
    /// frame a source was registered in, even if the drain has since
    /// entered deeper scopes.
    pub(crate) fn frame_at_depth_back(&mut self, back: usize) -> Option<&mut ScopeFrame> {
        let idx = self.level().checked_sub(back)?;
        self.0.get_mut(idx)
    }

    pub(crate) fn enter(&mut self) {
        self.0.push(ScopeFrame::new());
    }

    /// Pop the top frame. Fails if it's the outermost frame or non-empty.
    pub(crate) fn exit(&mut self) -> Result<(), ExitError> {
        if self.0.len() == 1 {
            return Err(ExitError::Underflow);
        }
        if !self.top().is_empty() {
            return Err(ExitError::NotEmpty);
        }
        self.0.pop();
        Ok(())
    }

    /// Pop every frame down to (and including, if non-empty) the outermost
    /// one, without requiring emptiness. Returns `true` if any frame that
    /// had to be popped was non-empty (the caller should raise
    /// `SCOPE_NOT_EXITED`). The contents of popped frames are drained into
    /// the caller, since dropping `Arc<Pipe>` handles silently would leave
    /// children neither untethered nor killed.
    pub(crate) fn vacate(&mut self) -> (bool, Vec<Arc<Pipe>>) {
        let mut warned = false;
        let mut orphans = Vec::new();
        while self.0.len() > 1 {
            let frame = self.0.pop().expect("checked len > 1");
            if !frame.is_empty() {
                warned = true;
            }
            orphans.extend(frame.blockers);
            orphans.extend(frame.finishers);
        }
        (warned, orphans)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitError {
    Underflow,
    NotEmpty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stack_is_outermost() {
        let s = ScopeStack::new();
        assert_eq!(s.level(), 0);
    }

    #[test]
    fn enter_then_exit_is_a_no_op() {
        let mut s = ScopeStack::new();
        s.enter();
        assert_eq!(s.level(), 1);
        assert!(s.exit().is_ok());
        assert_eq!(s.level(), 0);
    }

    #[test]
    fn exit_outermost_underflows() {
        let mut s = ScopeStack::new();
        assert_eq!(s.exit().unwrap_err(), ExitError::Underflow);
    }

    #[test]
    fn exit_nonempty_frame_fails() {
        let mut s = ScopeStack::new();
        s.enter();
        s.top_mut().truncation = 0;
        // simulate a non-empty frame without a real Pipe by checking the
        // emptiness gate directly; blockers/finishers require Arc<Pipe>
        // and are exercised in plumbing's integration tests instead.
        assert!(s.top().is_empty());
    }
}
