/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! Drain-side and source-side read/yield protocol, and the worker
//! entry point that ties vacating scopes, killing descendants, and
//! yielding into the sequence every spawned task runs through before it
//! exits.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::errs::PipeError;
use crate::pipe::{AnyResult, Pipe};

/// Read from a pipe with no drain: block on its termination condition.
/// Since nothing can kill an untethered read out from under it (there is
/// no drain to be killed), this can only return once the source yields.
pub(crate) fn untethered_read(s: &Arc<Pipe>) -> Result<(Option<AnyResult>, i32), PipeError> {
    let mut state = s.lock();
    if state.reader.is_some() {
        return Err(PipeError::NotDrain);
    }
    if !s.yielded.load(Ordering::Acquire) {
        state = s
            .termination
            .wait_while(state, |_| !s.yielded.load(Ordering::Acquire))
            .unwrap_or_else(|e| e.into_inner());
    }
    let result = state.result.take();
    let status = std::mem::take(&mut state.status);
    drop(state);
    if !crate::plumbing::killable(s) {
        return Err(PipeError::InvalidPipe);
    }
    Ok((result, status))
}

/// Read from a source tethered to the calling task's own pipe. Blocks on
/// the *drain's* progress condition, since any of the drain's other
/// blockers yielding, or the drain itself being killed, can wake it; the
/// loop re-checks the specific source it's waiting for each time.
pub(crate) fn tethered_read(s: &Arc<Pipe>) -> Result<(Option<AnyResult>, i32), PipeError> {
    let d = crate::context::current_or_new();
    if !crate::plumbing::drained_by(s, &d) {
        return Err(PipeError::NotDrain);
    }
    let mut d_state = d.lock();
    loop {
        if s.yielded.load(Ordering::Acquire) || d.killed.load(Ordering::Acquire) {
            break;
        }
        d_state = d
            .progress
            .wait(d_state)
            .unwrap_or_else(|e| e.into_inner());
    }
    drop(d_state);
    // The loop only exits when yielded or killed, so a source that hasn't
    // yielded here was interrupted by the drain being killed; matches
    // `tethered_read`'s `source->yielded ? source->status : NTHM_KILLED`
    // (a yielded source keeps its real result even if the drain was also
    // killed in the meantime).
    let outcome = if s.yielded.load(Ordering::Acquire) {
        let mut s_state = s.lock();
        Ok((s_state.result.take(), std::mem::take(&mut s_state.status)))
    } else {
        Err(PipeError::Killed)
    };
    if !crate::plumbing::killable(s) {
        return Err(PipeError::InvalidPipe);
    }
    outcome
}

/// A pipe that has no drain yields by setting its flag and signalling
/// termination directly; there's nobody else to tell.
fn untethered_yield(s: &Arc<Pipe>, status: i32) {
    let mut state = s.lock();
    s.yielded.store(true, Ordering::Release);
    s.termination.notify_all();
    if !s.killed.load(Ordering::Acquire) && state.status == 0 {
        state.status = status;
    }
}

/// A tethered pipe yields by moving itself from its drain's blockers to
/// its finishers and waking the drain's progress condition. It has to
/// find the scope frame it was originally registered in, which may no
/// longer be the drain's top frame if the drain has entered further
/// scopes since tethering.
fn tethered_yield(s: &Arc<Pipe>, status: i32) {
    let d = match s.lock().reader.clone() {
        Some(d) => d,
        None => return,
    };
    let mut d_state = d.lock();
    let level = d_state.scope.level();
    let depth = s.lock().depth;
    if level < depth {
        s.taint("tethered-yield-depth");
        return;
    }
    let Some(frame) = d_state.scope.frame_at_depth_back(level - depth) else {
        d.taint("tethered-yield-frame");
        return;
    };
    frame.blockers.retain(|b| !Arc::ptr_eq(b, s));
    frame.finishers.push_back(Arc::clone(s));
    s.yielded.store(true, Ordering::Release);
    drop(d_state);
    d.progress.notify_all();
    let mut s_state = s.lock();
    if s_state.status == 0 {
        s_state.status = status;
    }
}

/// Dispatch to the tethered or untethered yield protocol depending on
/// whether the source currently has a live reader. A killed source
/// always takes the untethered path: nobody is going to read it through
/// the ordinary tethered protocol once it's been told to stop.
fn yield_result(source: &Arc<Pipe>, status: i32) {
    if !crate::plumbing::descendants_killed(source) {
        source.taint("yield-descendants-killed");
        return;
    }
    let untethered = source.killed.load(Ordering::Acquire) || source.lock().reader.is_none();
    if untethered {
        untethered_yield(source, status);
    } else {
        tethered_yield(source, status);
    }
}

/// What a spawned worker closure returns: its result, type-erased, and
/// the status code it leaves behind for the reader to see.
pub(crate) struct WorkerOutcome {
    pub(crate) result: AnyResult,
    pub(crate) status: i32,
}

/// Run a worker function to completion in the calling thread and drive
/// it through the full lifecycle: install its pipe as the task context,
/// run the closure, vacate any scopes it forgot to exit, and yield (or,
/// for a write-only `send` pipe that nobody will ever read, retire
/// itself directly instead of going through the yield protocol).
pub(crate) fn run_worker<F>(pipe: Arc<Pipe>, write_only: bool, body: F)
where
    F: FnOnce() -> WorkerOutcome,
{
    crate::context::set(Arc::clone(&pipe));
    let outcome = body();
    let mut status = outcome.status;
    if !write_only {
        let mut state = pipe.lock();
        state.result = Some(outcome.result);
    }
    let (left_scopes_open, orphans) = pipe.lock().scope.vacate();
    for orphan in orphans {
        let _ = crate::plumbing::untethered(&orphan);
    }
    if left_scopes_open {
        status = if status == 0 { crate::errs::SCOPE_NOT_EXITED } else { status };
    }
    if write_only {
        if !crate::plumbing::acknowledged(&pipe, &mut status) {
            pipe.taint("send-worker-acknowledged");
        }
    } else {
        yield_result(&pipe, status);
    }
    crate::context::clear();
    crate::sync::reap_finished();
}
