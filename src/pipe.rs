/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! The pipe node itself: identity, validity tag, state flags, scope
//! stack, condition variables and the result slot.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::scope::ScopeStack;

/// `valid` holds this value whenever the pipe is healthy. Any other value
/// is a "muggle" identifying the call site of the first failed invariant
/// check, and every subsequent operation on the pipe fails fast.
pub(crate) const MAGIC: u32 = 0x4e54_484d;

pub(crate) type AnyResult = Box<dyn Any + Send>;

pub(crate) struct PipeState {
    /// The pipe's current drain, if tethered.
    pub(crate) reader: Option<Arc<Pipe>>,
    /// The drain's scope level at the moment this pipe was tethered.
    pub(crate) depth: usize,
    pub(crate) scope: ScopeStack,
    /// Whether this pipe currently sits in the root pool.
    pub(crate) pooled: bool,
    pub(crate) result: Option<AnyResult>,
    pub(crate) status: i32,
}

/// A node in the pipe graph: simultaneously a publication slot, a
/// cancellation token, and a queueing point.
pub struct Pipe {
    pub(crate) id: u64,
    pub(crate) valid: AtomicU32,
    pub(crate) killed: AtomicBool,
    pub(crate) zombie: AtomicBool,
    pub(crate) yielded: AtomicBool,
    /// Unmanaged-task placeholder: holds no worker, exists only to
    /// parent library-created children. Temporarily cleared by
    /// `kill_all` while it tears down descendants, so the placeholder
    /// can't be reclaimed out from under it mid-teardown.
    pub(crate) placeholder: AtomicBool,
    pub(crate) state: Mutex<PipeState>,
    /// Signalled when this pipe (acting as a drain) should be woken: a
    /// blocker yielded, or this pipe itself was killed.
    pub(crate) progress: Condvar,
    /// Signalled when an *untethered* pipe yields.
    pub(crate) termination: Condvar,
}

fn next_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl Pipe {
    pub(crate) fn new(placeholder: bool) -> Arc<Pipe> {
        Arc::new(Pipe {
            id: next_id(),
            valid: AtomicU32::new(MAGIC),
            killed: AtomicBool::new(false),
            zombie: AtomicBool::new(false),
            yielded: AtomicBool::new(false),
            placeholder: AtomicBool::new(placeholder),
            state: Mutex::new(PipeState {
                reader: None,
                depth: 0,
                scope: ScopeStack::new(),
                pooled: false,
                result: None,
                status: 0,
            }),
            progress: Condvar::new(),
            termination: Condvar::new(),
        })
    }

    /// Fast-path corruption check: the only field read without a lock.
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) == MAGIC
    }

    /// Taint this pipe so every subsequent operation on it fails with
    /// `InvalidPipe`. Idempotent: the first taint sticks.
    pub(crate) fn taint(&self, site: &'static str) {
        let muggle = crate::errs::internal_error(site);
        let _ = self
            .valid
            .compare_exchange(MAGIC, muggle, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True iff this pipe is ready to be freed: a zombie short-circuits
    /// to retirable unconditionally; otherwise it needs an empty,
    /// un-enclosed scope frame and either to be a placeholder or to have
    /// both yielded and been killed.
    pub(crate) fn retirable(self: &Arc<Pipe>) -> bool {
        if self.zombie.load(Ordering::Acquire) {
            return true;
        }
        let state = self.lock();
        state.scope.level() == 0
            && state.scope.top().is_empty()
            && (self.placeholder.load(Ordering::Acquire)
                || (self.yielded.load(Ordering::Acquire) && self.killed.load(Ordering::Acquire)))
    }

    /// Identity comparison for locating a pipe within a parent's
    /// collections — the Rust analogue of comparing `pipe_list` entries'
    /// `complement` pointers.
    pub(crate) fn same_as(self: &Arc<Pipe>, other: &Arc<Pipe>) -> bool {
        Arc::ptr_eq(self, other)
    }
}

/// Destroy a pipe's structure. Precondition, matching `_nthm_retired`
/// exactly (`pipes.c`): an empty, un-enclosed scope frame — nothing
/// about `reader` or `killed`. A finisher dequeued by
/// `descendants_killed` still has its `reader` pointed at the drain that
/// just dequeued it, and a `send` pipe acknowledged by `acknowledged` is
/// never killed; both are ordinary, healthy teardown paths, not
/// invariant breaks, and `retire` must accept them the way the original
/// does. Callers that need the *ready-to-retire* predicate, as opposed
/// to this structural precondition, use [`Pipe::retirable`] first (the
/// pool does, deciding whether to retire or park a pipe).
///
/// In Rust the mutex/condvars are reclaimed by `Drop` once the last
/// `Arc` goes away; this function's job is to validate the precondition
/// and taint the pipe so any lingering reference fails fast instead of
/// silently resurrecting a "retired" node.
pub(crate) fn retire(p: &Arc<Pipe>) {
    if !p.is_valid() {
        return;
    }
    let empty_and_outermost = {
        let state = p.lock();
        state.scope.level() == 0 && state.scope.top().is_empty()
    };
    if !empty_and_outermost {
        p.taint("retire-precondition");
        return;
    }
    p.valid.store(RETIRED, Ordering::Release);
}

/// Distinguishable from any live muggle: a pipe that was cleanly retired
/// rather than corrupted. Both are "not MAGIC", so all the usual
/// fail-fast behavior still applies to a retired pipe.
pub(crate) const RETIRED: u32 = 0xdead_beef;

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .field("killed", &self.killed.load(Ordering::Relaxed))
            .field("yielded", &self.yielded.load(Ordering::Relaxed))
            .field("placeholder", &self.placeholder.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pipe_is_valid_and_not_retirable_unless_placeholder() {
        let p = Pipe::new(false);
        assert!(p.is_valid());
        assert!(!p.retirable());
        let ph = Pipe::new(true);
        assert!(ph.retirable());
    }

    #[test]
    fn taint_sticks() {
        let p = Pipe::new(false);
        p.taint("test-site");
        assert!(!p.is_valid());
        p.taint("another-site");
        // first taint wins; valid stays at whatever the first CAS set it to
        assert!(!p.is_valid());
    }

    #[test]
    fn yielded_and_killed_makes_a_tethered_pipe_retirable() {
        let p = Pipe::new(false);
        assert!(!p.retirable());
        p.yielded.store(true, Ordering::Release);
        assert!(!p.retirable());
        p.killed.store(true, Ordering::Release);
        assert!(p.retirable());
    }
}
