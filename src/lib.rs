/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! Hierarchies of cooperating worker threads whose results flow through
//! pipes from child to parent.
//!
//! [`open`] spawns a thread tethered to the caller and hands back a
//! [`PipeHandle`] the caller can [`read`] later; [`send`] spawns a
//! fire-and-forget thread whose result nobody will ever collect. Workers
//! poll [`killed`] and [`truncated`] cooperatively — nothing here
//! preempts a running thread. [`enter_scope`]/[`exit_scope`] bound which
//! of a task's own children [`select`]/[`busy`]/[`blocked`] can see,
//! letting a long-lived worker manage several independent batches of
//! children without one batch's bookkeeping leaking into another's.
//!
//! Every pipe not read, tethered, or still running when the process
//! calls [`shutdown`] is reclaimed there; [`sync`] on its own just joins
//! outstanding worker threads without touching the pipe graph.

mod context;
mod errs;
mod pipe;
mod plumbing;
mod pool;
mod protocol;
mod scope;
mod sync;

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

pub use errs::{flush, PipeError};
pub use sync::RuntimeConfig;

use pipe::Pipe;

/// A readable handle to a pipe tethered to the task that opened it.
///
/// Dropping a handle without reading it leaks nothing: the worker still
/// runs to completion, and its result is reclaimed by [`shutdown`] (or
/// earlier, if the task that opened it exits its enclosing scope).
pub struct PipeHandle<T> {
    pipe: Arc<Pipe>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for PipeHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PipeHandle").field(&self.pipe).finish()
    }
}

/// A pipe that has been [`untether`]ed from its drain: still readable,
/// but no longer visible to the drain's [`select`]/[`busy`]/[`blocked`].
pub struct UntetheredPipe<T> {
    pipe: Arc<Pipe>,
    _marker: PhantomData<fn() -> T>,
}

/// One readable pipe returned by [`select`], its concrete type erased
/// until the caller downcasts it with [`AnyFinished::read`].
pub struct AnyFinished {
    pipe: Arc<Pipe>,
}

impl AnyFinished {
    /// Consume the handle, returning the typed result. `T` must match
    /// the type the originating [`open`] call was parameterized with;
    /// a mismatch is a caller bug, not a runtime condition, so this
    /// panics rather than returning an error — the same way a
    /// `Box<dyn Any>::downcast` misuse would.
    pub fn read<T: Send + 'static>(self) -> Result<T, PipeError> {
        read(PipeHandle {
            pipe: self.pipe,
            _marker: PhantomData,
        })
    }
}

/// A scope entered with [`enter_scope`]. Dropping it without passing it
/// to [`exit_scope`] exits the scope implicitly (untethering, not
/// killing, anything still inside it) rather than leaving the frame open
/// until the enclosing worker finishes; a warning is logged, matching
/// §4.9's "vacate scopes, warn if non-empty" for the implicit path.
#[must_use]
pub struct ScopeGuard {
    exited: std::cell::Cell<bool>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.exited.get() {
            return;
        }
        let Some(p) = context::current() else {
            return;
        };
        if p.lock().scope.level() == 0 {
            return;
        }
        tracing::warn!(pipe = ?p, "scope guard dropped without exit_scope; vacating implicitly");
        let _ = exit_current_scope(&p);
    }
}

/// Shared by the explicit [`exit_scope`] and [`ScopeGuard`]'s implicit
/// drop path: untether everything still in the current scope frame, then
/// pop it.
fn exit_current_scope(p: &Arc<Pipe>) -> Result<(), PipeError> {
    if !plumbing::descendants_untethered(p) {
        return Err(PipeError::InvalidPipe);
    }
    match p.lock().scope.exit() {
        Ok(()) => {
            pool::unpool(p);
            Ok(())
        }
        Err(scope::ExitError::Underflow) => Err(PipeError::ScopeUnderflow),
        Err(scope::ExitError::NotEmpty) => Err(PipeError::InvalidPipe),
    }
}

fn downcast<T: Send + 'static>(boxed: Option<Box<dyn Any + Send>>) -> Option<T> {
    boxed.and_then(|b| b.downcast::<T>().ok()).map(|b| *b)
}

/// Handed to a worker spawned by [`open`]/[`open_with`] so it can poll
/// its own cancellation state directly, without a thread-local lookup of
/// its own identity. Equivalent to calling the free functions [`killed`]
/// and [`truncated`] from inside the worker; kept as an explicit
/// capability since the worker closure is the one place that
/// unambiguously *is* the task in question.
pub struct TruncationToken {
    _private: (),
}

impl TruncationToken {
    /// Has this task (or an ancestor) been killed or already yielded?
    pub fn killed(&self) -> bool {
        killed()
    }

    /// Has this task (or an ancestor) been asked to truncate its output?
    pub fn truncated(&self) -> u64 {
        truncated()
    }
}

/// Spawn a thread running `worker(operand, &token)`, tethered to the
/// calling task, and return a handle the caller can [`read`] to collect
/// its result.
///
/// Fails with [`PipeError::Killed`] if the calling task has itself been
/// killed or has already yielded (calling `open` from code that ran
/// after the worker it's in returned), and with
/// [`PipeError::SpawnFailed`] or [`PipeError::OutOfMemory`] if the OS
/// refuses to create the thread.
pub fn open<A, T, F>(operand: A, worker: F) -> Result<PipeHandle<T>, PipeError>
where
    A: Send + 'static,
    T: Send + 'static,
    F: FnOnce(A, &TruncationToken) -> T + Send + 'static,
{
    open_with(RuntimeConfig::default(), operand, worker)
}

/// Like [`open`], but spawning the worker thread under an explicit
/// [`RuntimeConfig`] (currently, its stack size).
pub fn open_with<A, T, F>(
    config: RuntimeConfig,
    operand: A,
    worker: F,
) -> Result<PipeHandle<T>, PipeError>
where
    A: Send + 'static,
    T: Send + 'static,
    F: FnOnce(A, &TruncationToken) -> T + Send + 'static,
{
    let drain = context::current_or_new();
    if drain.yielded.load(std::sync::atomic::Ordering::Acquire)
        || plumbing::heritably_killed_or_yielded(&drain)
    {
        return Err(PipeError::Killed);
    }
    let source = Pipe::new(false);
    if !plumbing::tethered(&source, &drain) {
        source.taint("open-fresh-tether-failed");
        return Err(PipeError::InvalidPipe);
    }
    let worker_pipe = Arc::clone(&source);
    let spawned = sync::spawn(config, move || {
        protocol::run_worker(worker_pipe, false, move || {
            let token = TruncationToken { _private: () };
            let value = worker(operand, &token);
            protocol::WorkerOutcome {
                result: Box::new(value),
                status: 0,
            }
        });
    });
    if let Err(e) = spawned {
        // no thread will ever yield this pipe; mark it a zombie so it's
        // immediately retirable instead of waiting forever to be read
        source.zombie.store(true, std::sync::atomic::Ordering::Release);
        let _ = plumbing::untethered(&source);
        return Err(e);
    }
    Ok(PipeHandle {
        pipe: source,
        _marker: PhantomData,
    })
}

/// Spawn a thread running `mutator(operand)` whose result nobody will
/// ever read. The pipe retires itself the moment the thread finishes;
/// [`sync`] and [`shutdown`] still wait for it like any other spawned
/// thread.
pub fn send<A, F>(operand: A, mutator: F) -> Result<(), PipeError>
where
    A: Send + 'static,
    F: FnOnce(A) + Send + 'static,
{
    if let Some(current) = context::current() {
        if plumbing::heritably_killed_or_yielded(&current) {
            return Err(PipeError::Killed);
        }
    }
    let source = Pipe::new(false);
    let worker_pipe = Arc::clone(&source);
    sync::spawn(RuntimeConfig::default(), move || {
        protocol::run_worker(worker_pipe, true, move || {
            mutator(operand);
            protocol::WorkerOutcome {
                result: Box::new(()),
                status: 0,
            }
        });
    })
    .map_err(|_| PipeError::SpawnFailed)
}

/// Block until `handle`'s worker finishes, then return its result.
/// Retires the pipe: the handle is consumed, and nothing can read it
/// again under any name.
pub fn read<T: Send + 'static>(handle: PipeHandle<T>) -> Result<T, PipeError> {
    let (boxed, status) = match context::current() {
        Some(drain) => {
            if !plumbing::tethered(&handle.pipe, &drain) {
                return Err(PipeError::NotDrain);
            }
            protocol::tethered_read(&handle.pipe)?
        }
        None => protocol::untethered_read(&handle.pipe)?,
    };
    if status != 0 {
        // a worker's own status code is user-defined; errs surfaces only
        // the fixed internal codes, so a non-zero status that isn't one
        // of those is reported as an opaque invalid-pipe condition
        if status == errs::SCOPE_NOT_EXITED {
            tracing::warn!(pipe = ?handle.pipe, "worker left scopes open; they were vacated implicitly");
        }
    }
    downcast::<T>(boxed).ok_or(PipeError::InvalidPipe)
}

/// Would reading `handle` block right now?
pub fn busy<T>(handle: &PipeHandle<T>) -> Result<bool, PipeError> {
    if !handle.pipe.is_valid() {
        return Err(PipeError::InvalidPipe);
    }
    Ok(!handle.pipe.yielded.load(std::sync::atomic::Ordering::Acquire))
}

/// Would [`select`] block right now?
pub fn blocked() -> bool {
    let Some(drain) = context::current() else {
        return false;
    };
    let state = drain.lock();
    let frame = state.scope.top();
    frame.finishers.is_empty() && !frame.blockers.is_empty()
}

/// Block until one of the calling task's children (within its current
/// scope) has finished, and return it. Returns `Ok(None)` immediately if
/// there is nothing left to wait for, and `Err(Killed)` if the calling
/// task is killed while waiting.
pub fn select() -> Result<Option<AnyFinished>, PipeError> {
    let Some(drain) = context::current() else {
        return Ok(None);
    };
    let mut state = drain.lock();
    loop {
        if drain.killed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(PipeError::Killed);
        }
        if let Some(finisher) = state.scope.top_mut().finishers.pop_front() {
            return Ok(Some(AnyFinished { pipe: finisher }));
        }
        if state.scope.top().blockers.is_empty() {
            return Ok(None);
        }
        state = drain
            .progress
            .wait(state)
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// Ask `handle`'s worker to return a partial result as soon as it next
/// polls [`truncated`]. A no-op, not an error, if `handle` isn't
/// currently tethered to the calling task.
pub fn truncate<T>(handle: &PipeHandle<T>) -> Result<(), PipeError> {
    let drain = context::current().ok_or(PipeError::Unmanaged)?;
    if !plumbing::drained_by(&handle.pipe, &drain) {
        return Err(PipeError::NotDrain);
    }
    let mut state = handle.pipe.lock();
    let frame = state.scope.top_mut();
    frame.truncation = frame.truncation.saturating_add(1);
    Ok(())
}

/// Ask every child tethered to the calling task, in its current scope,
/// to return a partial result.
pub fn truncate_all() {
    let drain = context::current_or_new();
    let mut state = drain.lock();
    let frame = state.scope.top_mut();
    frame.truncation = frame.truncation.saturating_add(1);
}

/// Has the calling task (or any of its ancestors) been asked to
/// truncate its output? Returns the request count, saturating, so
/// callers that care only about "should I stop" can test for non-zero.
pub fn truncated() -> u64 {
    match context::current() {
        Some(source) => plumbing::heritably_truncated(&source),
        None => 0,
    }
}

/// Tell `handle`'s worker to stop as soon as it next polls [`killed`].
/// `handle` remains readable afterward: a killed worker still yields (or
/// is retired directly if it had already yielded), and its eventual
/// [`read`] reports whatever status it left behind.
pub fn kill<T>(handle: &PipeHandle<T>) -> Result<(), PipeError> {
    if !handle.pipe.is_valid() {
        return Err(PipeError::InvalidPipe);
    }
    if !plumbing::killable(&handle.pipe) {
        return Err(PipeError::InvalidPipe);
    }
    Ok(())
}

/// Kill every child tethered to the calling task in its current scope.
pub fn kill_all() {
    use std::sync::atomic::Ordering;
    let drain = context::current_or_new();
    // Clear the placeholder flag for the duration of the teardown so a
    // concurrent reclaim can't retire `drain` out from under us the
    // moment its last descendant is killed.
    let was_placeholder = drain.placeholder.swap(false, Ordering::AcqRel);
    if !plumbing::descendants_killed(&drain) {
        drain.placeholder.store(was_placeholder, Ordering::Release);
        drain.taint("kill-all-descendants-killed");
        return;
    }
    if was_placeholder {
        drain.placeholder.store(true, Ordering::Release);
        pool::unpool(&drain);
    }
}

/// Has the calling task (or any of its ancestors) been killed, or has it
/// already yielded? Called from outside a managed task this always
/// returns `true`, since nothing is tracking its lifetime for anyone to
/// cancel.
pub fn killed() -> bool {
    match context::current() {
        Some(source) => plumbing::heritably_killed_or_yielded(&source),
        None => true,
    }
}

/// Emancipate `handle` from the calling task so that it survives the
/// task's exit and is no longer visible to the task's [`select`].
pub fn untether<T>(handle: PipeHandle<T>) -> Result<UntetheredPipe<T>, PipeError> {
    if !handle.pipe.is_valid() {
        return Err(PipeError::InvalidPipe);
    }
    if !plumbing::untethered(&handle.pipe) {
        return Err(PipeError::InvalidPipe);
    }
    Ok(UntetheredPipe {
        pipe: handle.pipe,
        _marker: PhantomData,
    })
}

/// Tether a previously untethered pipe to the calling task.
pub fn tether<T>(pipe: UntetheredPipe<T>) -> Result<PipeHandle<T>, PipeError> {
    let drain = context::current_or_new();
    if drain.yielded.load(std::sync::atomic::Ordering::Acquire) {
        return Err(PipeError::InvalidPipe);
    }
    if plumbing::heritably_killed_or_yielded(&drain) {
        return Err(PipeError::Killed);
    }
    if !plumbing::tethered(&pipe.pipe, &drain) {
        return Err(PipeError::NotDrain);
    }
    Ok(PipeHandle {
        pipe: pipe.pipe,
        _marker: PhantomData,
    })
}

/// Restrict [`select`]/[`busy`]/[`blocked`] to pipes opened from here
/// on, until the matching [`exit_scope`].
pub fn enter_scope() -> Result<ScopeGuard, PipeError> {
    let p = context::current_or_new();
    if p.yielded.load(std::sync::atomic::Ordering::Acquire)
        || plumbing::heritably_killed_or_yielded(&p)
    {
        return Err(PipeError::Killed);
    }
    p.lock().scope.enter();
    Ok(ScopeGuard {
        exited: std::cell::Cell::new(false),
    })
}

/// Resume the previous scope. Any pipes opened since the matching
/// [`enter_scope`] are untethered first, so they continue to exist as
/// independent, readable pipes rather than vanishing with the scope.
pub fn exit_scope(guard: ScopeGuard) -> Result<(), PipeError> {
    guard.exited.set(true);
    let p = context::current().ok_or(PipeError::ScopeUnderflow)?;
    if p.lock().scope.level() == 0 {
        return Err(PipeError::ScopeUnderflow);
    }
    exit_current_scope(&p)
}

/// Block until every thread spawned by [`open`] or [`send`] has been
/// joined. Does not reclaim untethered pipes left in the root pool; for
/// that, call [`shutdown`].
pub fn sync() {
    sync::synchronize();
}

/// Join every outstanding worker thread and reclaim every pipe left
/// untethered in the root pool. Intended to run once, near the end of
/// `main`.
pub fn shutdown() {
    sync::synchronize();
    pool::eradicate();
    errs::flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_read_round_trips_a_value() {
        let handle = open(41, |n, _tok| n + 1).unwrap();
        assert_eq!(read(handle).unwrap(), 42);
    }

    #[test]
    fn send_runs_and_is_joined_by_sync() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        send(flag, |flag| {
            flag.store(true, std::sync::atomic::Ordering::Release);
        })
        .unwrap();
        sync();
        assert!(ran.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn kill_before_read_is_observable_by_the_worker() {
        let started = Arc::new(std::sync::Barrier::new(2));
        let s = Arc::clone(&started);
        let handle = open(s, |s, tok| {
            s.wait();
            while !tok.killed() {
                std::thread::yield_now();
            }
            7
        })
        .unwrap();
        started.wait();
        kill(&handle).unwrap();
        sync();
    }

    #[test]
    fn select_returns_children_as_they_finish() {
        let guard = enter_scope().unwrap();
        let a = open((), |_, _| 1).unwrap();
        let b = open((), |_, _| 2).unwrap();
        let mut total = 0;
        for _ in 0..2 {
            let finished = select().unwrap().expect("a child is still running");
            total += finished.read::<i32>().unwrap();
        }
        assert_eq!(total, 3);
        let _ = (a, b);
        exit_scope(guard).unwrap();
    }

    #[test]
    fn scopes_isolate_select() {
        let outer = open((), |_, _| "outer").unwrap();
        let guard = enter_scope().unwrap();
        assert!(!blocked());
        exit_scope(guard).unwrap();
        assert_eq!(read(outer).unwrap(), "outer");
    }
}
