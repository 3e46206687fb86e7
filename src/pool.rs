/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! The process-wide root pool: every pipe with no live drain (untethered
//! pipes and unmanaged-task placeholders) lives here so that shutdown can
//! find and reclaim it.

use std::sync::atomic::Ordering;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use crate::pipe::Pipe;

fn root() -> &'static Mutex<Vec<Arc<Pipe>>> {
    static ROOT: OnceLock<Mutex<Vec<Arc<Pipe>>>> = OnceLock::new();
    ROOT.get_or_init(|| Mutex::new(Vec::new()))
}

/// Insert `d` into the root pool unconditionally. Benign (no-op) if `d`
/// is already pooled.
pub(crate) fn placed(d: &Arc<Pipe>) {
    if !d.is_valid() {
        return;
    }
    let mut pool = root().lock().unwrap_or_else(|e| e.into_inner());
    let mut state = d.lock();
    if state.pooled {
        return;
    }
    state.pooled = true;
    drop(state);
    pool.push(Arc::clone(d));
}

/// Insert `d` into the pool if it isn't retirable yet, otherwise retire
/// it directly.
pub(crate) fn pooled(d: &Arc<Pipe>) {
    if d.retirable() {
        displace(d);
        crate::pipe::retire(d);
    } else {
        placed(d);
    }
}

/// Take `p` out of the root pool unconditionally. Benign if absent.
pub(crate) fn displace(p: &Arc<Pipe>) {
    let mut pool = root().lock().unwrap_or_else(|e| e.into_inner());
    let mut state = p.lock();
    if state.pooled {
        state.pooled = false;
        drop(state);
        pool.retain(|q| !Arc::ptr_eq(q, p));
    }
}

/// If `p` is retirable, take it out of the pool and retire it. If `p`
/// was the calling task's placeholder, also clear the task-local
/// context, since nothing will ever read through it again.
pub(crate) fn unpool(p: &Arc<Pipe>) {
    if !p.retirable() {
        return;
    }
    let was_current_placeholder =
        p.placeholder.load(Ordering::Acquire)
            && crate::context::current().map(|c| Arc::ptr_eq(&c, p)).unwrap_or(false);
    displace(p);
    crate::pipe::retire(p);
    if was_current_placeholder {
        crate::context::clear();
    }
}

/// Reclaim every pipe left in the pool. Called from [`crate::shutdown`].
/// Mirrors `nthm`'s `eradicate`: each pooled pipe either retires directly
/// (if already retirable) or is killed-and-read so its worker, if any is
/// still blocked waiting to be read, is unblocked and its result
/// discarded.
pub(crate) fn eradicate() {
    loop {
        let next = {
            let mut pool = root().lock().unwrap_or_else(|e| e.into_inner());
            pool.pop()
        };
        let Some(p) = next else { break };
        {
            let mut state = p.lock();
            state.pooled = false;
        }
        if p.retirable() {
            crate::pipe::retire(&p);
            continue;
        }
        // Not retirable: either still running (untethered, unyielded) or
        // a placeholder with live descendants. A placeholder is killed so
        // its implicit "keep the tree alive" role ends; an ordinary
        // untethered pipe is read-and-discarded so its worker thread,
        // blocked signalling `termination`, is freed and its result
        // dropped.
        if p.placeholder.load(Ordering::Acquire) {
            p.killed.store(true, Ordering::Release);
            continue;
        }
        let _ = crate::protocol::untethered_read(&p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placed_then_displaced_round_trips() {
        let p = Pipe::new(true);
        placed(&p);
        assert!(p.lock().pooled);
        displace(&p);
        assert!(!p.lock().pooled);
    }

    #[test]
    fn double_place_is_benign() {
        let p = Pipe::new(true);
        placed(&p);
        placed(&p);
        assert_eq!(root().lock().unwrap().iter().filter(|q| Arc::ptr_eq(q, &p)).count(), 1);
        displace(&p);
    }
}
