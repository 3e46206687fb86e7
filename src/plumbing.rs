/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! Tethering, untethering, and the kill cascade: the operations that
//! actually reshape the pipe graph. Every function here that touches two
//! pipes locks the source before the drain, and releases the source's
//! lock before the drain's, to keep lock order consistent with
//! [`crate::protocol`] and avoid deadlock between a worker yielding and a
//! drain reading.

use std::sync::Arc;

use crate::pipe::Pipe;

/// Is `d` the drain of `s`, in `d`'s current scope? True only if `s`
/// actually has `d` as its reader *and* `s` was tethered at `d`'s current
/// scope depth — a drain that has since entered a deeper scope no longer
/// "drains by" the same identity check, which is what makes re-tethering
/// across a scope boundary fail instead of silently reattaching.
pub(crate) fn drained_by(s: &Arc<Pipe>, d: &Arc<Pipe>) -> bool {
    let state = s.lock();
    match &state.reader {
        Some(reader) if Arc::ptr_eq(reader, d) => state.depth == d.lock().scope.level(),
        _ => false,
    }
}

/// Tether a source `s` to a drain `d`, unless it's tethered there
/// already. If `s` already has a different reader, or the same reader at
/// a scope depth that no longer matches, this fails. A source that has
/// already yielded goes straight into `d`'s finishers; a still-running
/// source goes into `d`'s blockers. Either way, `s` is taken out of the
/// root pool, since a tethered pipe is never pooled.
pub(crate) fn tethered(s: &Arc<Pipe>, d: &Arc<Pipe>) -> bool {
    let already = {
        let state = s.lock();
        state.reader.is_some()
    };
    let ok = if already {
        drained_by(s, d)
    } else {
        let mut s_state = s.lock();
        if s_state.reader.is_some() {
            false
        } else {
            let mut d_state = d.lock();
            s_state.reader = Some(Arc::clone(d));
            s_state.depth = d_state.scope.level();
            let yielded = s.yielded.load(std::sync::atomic::Ordering::Acquire);
            if yielded {
                d_state.scope.top_mut().finishers.push_back(Arc::clone(s));
            } else {
                d_state.scope.top_mut().blockers.push(Arc::clone(s));
            }
            true
        }
    };
    crate::pool::displace(s);
    ok
}

/// Separate a source from its drain. If `s` has no reader, this is just
/// the pooling step. Otherwise `s` must be drained by the calling task's
/// own pipe — a source can only untether itself from the drain it's
/// currently running under.
pub(crate) fn untethered(s: &Arc<Pipe>) -> bool {
    let has_reader = s.lock().reader.is_some();
    if !has_reader {
        crate::pool::pooled(s);
        return true;
    }
    let d = crate::context::current_or_new();
    if !drained_by(s, &d) {
        return false;
    }
    let removed = {
        let mut s_state = s.lock();
        let mut d_state = d.lock();
        let frame = d_state.scope.top_mut();
        let before = frame.blockers.len() + frame.finishers.len();
        frame.blockers.retain(|b| !Arc::ptr_eq(b, s));
        frame.finishers.retain(|f| !Arc::ptr_eq(f, s));
        let removed = before != frame.blockers.len() + frame.finishers.len();
        if removed {
            s_state.reader = None;
        }
        removed
    };
    crate::pool::unpool(&d);
    if removed {
        crate::pool::pooled(s);
    }
    removed
}

/// Untether every blocker and finisher under `p`'s current scope frame,
/// one at a time. Draining the list this way (snapshot one entry, drop
/// the lock, untether, repeat) means the lock on `p` is never held while
/// a child's own lock is taken, avoiding the child-before-parent
/// ordering from being inverted.
pub(crate) fn descendants_untethered(p: &Arc<Pipe>) -> bool {
    loop {
        let next = {
            let state = p.lock();
            let frame = state.scope.top();
            frame
                .finishers
                .front()
                .cloned()
                .or_else(|| frame.blockers.first().cloned())
        };
        match next {
            Some(child) => {
                if !untethered(&child) {
                    return false;
                }
            }
            None => return true,
        }
    }
}

/// Kill `s` and untether it. Killing only sets the flag and wakes
/// whoever might be waiting on its progress; the actual teardown happens
/// through the ordinary untether/pool path.
pub(crate) fn killable(s: &Arc<Pipe>) -> bool {
    s.killed.store(true, std::sync::atomic::Ordering::Release);
    if !s.yielded.load(std::sync::atomic::Ordering::Acquire) {
        s.progress.notify_all();
    }
    untethered(s)
}

/// Kill every blocker of `d`, one at a time, without holding `d`'s lock
/// while killing (killing a blocker untethers it, which needs to lock
/// both ends).
fn blockers_killed(d: &Arc<Pipe>) -> bool {
    loop {
        let next = {
            let state = d.lock();
            state.scope.top().blockers.first().cloned()
        };
        match next {
            Some(child) => {
                if !killable(&child) {
                    return false;
                }
            }
            None => return true,
        }
    }
}

/// Kill both the blockers and the finishers under `d`'s current scope
/// frame. Finishers are assumed to have already had their own
/// descendants killed (they're done running); they're simply retired.
pub(crate) fn descendants_killed(d: &Arc<Pipe>) -> bool {
    if !blockers_killed(d) {
        return false;
    }
    loop {
        let next = {
            let mut state = d.lock();
            state.scope.top_mut().finishers.pop_front()
        };
        match next {
            Some(finisher) => {
                if finisher.lock().pooled {
                    finisher.taint("descendants-killed-pooled-finisher");
                    return false;
                }
                crate::pipe::retire(&finisher);
            }
            None => return true,
        }
    }
}

/// Retire an untethered, unpooled pipe, taking note of its status as the
/// error to report if the caller hasn't already got one of its own.
pub(crate) fn acknowledged(s: &Arc<Pipe>, status: &mut i32) -> bool {
    if *status == 0 {
        *status = s.lock().status;
    }
    if !descendants_killed(s) {
        return false;
    }
    crate::pipe::retire(s);
    true
}

/// Detect whether `source` has yielded or been killed, explicitly or
/// because any of its drains, up the tether chain, has. Flags are
/// atomics, so this is a lock-free walk; the snapshot it returns can be
/// stale the instant it's taken, which callers already account for since
/// `killed`/`yielded` only ever move from false to true.
pub(crate) fn heritably_killed_or_yielded(source: &Arc<Pipe>) -> bool {
    use std::sync::atomic::Ordering::Acquire;
    let mut node = Arc::clone(source);
    loop {
        if node.yielded.load(Acquire) || node.killed.load(Acquire) {
            return true;
        }
        let next = node.lock().reader.clone();
        match next {
            Some(reader) => node = reader,
            None => return false,
        }
    }
}

/// Detect whether `source` has been truncated, explicitly or because an
/// enclosing drain's matching scope frame has. Unlike kill/yield status,
/// truncation is scoped: a drain's truncation request at scope level `l`
/// only reaches sources tethered at or below that level.
pub(crate) fn heritably_truncated(source: &Arc<Pipe>) -> u64 {
    let mut node = Arc::clone(source);
    loop {
        if node.yielded.load(std::sync::atomic::Ordering::Acquire)
            || node.killed.load(std::sync::atomic::Ordering::Acquire)
        {
            return 1;
        }
        let local = node.lock().scope.top().truncation;
        if local != 0 {
            return local;
        }
        let (reader, depth) = {
            let state = node.lock();
            (state.reader.clone(), state.depth)
        };
        let Some(reader) = reader else { return 0 };
        let truncation = {
            let mut r_state = reader.lock();
            let level = r_state.scope.level();
            if level < depth {
                return 0;
            }
            let back = level - depth;
            r_state
                .scope
                .frame_at_depth_back(back)
                .map(|f| f.truncation)
                .unwrap_or(0)
        };
        if truncation != 0 {
            return truncation;
        }
        node = reader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tether_then_drained_by_holds() {
        let d = Pipe::new(true);
        let s = Pipe::new(false);
        assert!(tethered(&s, &d));
        assert!(drained_by(&s, &d));
        assert_eq!(d.lock().scope.top().blockers.len(), 1);
    }

    #[test]
    fn retethering_same_drain_is_idempotent() {
        let d = Pipe::new(true);
        let s = Pipe::new(false);
        assert!(tethered(&s, &d));
        assert!(tethered(&s, &d));
        assert_eq!(d.lock().scope.top().blockers.len(), 1);
    }

    #[test]
    fn tethering_a_second_drain_fails() {
        let d1 = Pipe::new(true);
        let d2 = Pipe::new(true);
        let s = Pipe::new(false);
        assert!(tethered(&s, &d1));
        assert!(!tethered(&s, &d2));
    }

    #[test]
    fn killable_untethers_a_blocker() {
        // killable/untethered assume they're running in the drain's own
        // task, the way blockers_killed calls them from inside kill_all
        let d = Pipe::new(true);
        let s = Pipe::new(false);
        assert!(tethered(&s, &d));
        crate::context::set(Arc::clone(&d));
        assert!(killable(&s));
        crate::context::clear();
        assert!(s.killed.load(std::sync::atomic::Ordering::Acquire));
        assert!(d.lock().scope.top().is_empty());
    }

    #[test]
    fn heritably_killed_propagates_up_the_chain() {
        let grandparent = Pipe::new(true);
        let parent = Pipe::new(false);
        let child = Pipe::new(false);
        assert!(tethered(&parent, &grandparent));
        assert!(tethered(&child, &parent));
        assert!(!heritably_killed_or_yielded(&child));
        parent.killed.store(true, std::sync::atomic::Ordering::Release);
        assert!(heritably_killed_or_yielded(&child));
    }
}
