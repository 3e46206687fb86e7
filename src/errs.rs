/*
    MIT License

    Copyright (c) 2020 Philipp Schuster

    Permission is hereby granted, free of charge, to any person obtaining a copy
    of this software and associated documentation files (the "Software"), to deal
    in the Software without restriction, including without limitation the rights
    to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
    copies of the Software, and to permit persons to whom the Software is
    furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in all
    copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
    OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
    SOFTWARE.
*/

//! Error taxonomy for the pipe graph, plus the bounded sink that latches
//! internal invariant failures until they can be printed at shutdown.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::OnceLock;

/// Every way a pipe operation can fail.
///
/// `Killed` is not an error in the usual sense: it is the documented
/// outcome of a blocking read or select when the caller's own pipe was
/// killed out from under it. Callers that just want "did I get a result"
/// match on it like any other variant; callers that want to distinguish
/// cancellation from failure can do so explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PipeError {
    /// A null/absent pipe was passed where one was required.
    #[error("null pipe")]
    NullPipe,
    /// The pipe has been tainted by a prior internal invariant failure.
    #[error("invalid pipe")]
    InvalidPipe,
    /// The calling task is not the pipe's current drain.
    #[error("not the drain")]
    NotDrain,
    /// The operation requires a managed task context and none exists.
    #[error("called outside a managed task")]
    Unmanaged,
    /// `exit_scope` was called with no enclosing scope left to pop.
    #[error("scope stack underflow")]
    ScopeUnderflow,
    /// The calling task was killed while blocked in this operation.
    #[error("killed")]
    Killed,
    /// The system ran out of memory creating a pipe or thread.
    #[error("out of memory")]
    OutOfMemory,
    /// The OS refused to create a new thread (e.g. resource limits).
    #[error("thread spawn failed")]
    SpawnFailed,
}

/// Cooperative warning stamped on a worker's status when it left scopes
/// open and they had to be vacated implicitly on its behalf.
pub const SCOPE_NOT_EXITED: i32 = 1;

const SINK_CAPACITY: usize = 64;

fn sink() -> &'static Mutex<VecDeque<String>> {
    static SINK: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();
    SINK.get_or_init(|| Mutex::new(VecDeque::with_capacity(SINK_CAPACITY)))
}

/// Latch an internal invariant failure: log it and record it in the
/// bounded global sink so it is never silently dropped. Returns a
/// muggle code distinct from [`crate::pipe::MAGIC`] so the caller can
/// stamp it into the offending pipe's `valid` tag.
pub(crate) fn internal_error(site: &'static str) -> u32 {
    tracing::error!(site, "internal invariant failure");
    let mut guard = sink().lock().unwrap_or_else(|e| e.into_inner());
    if guard.len() == SINK_CAPACITY {
        guard.pop_front();
    }
    guard.push_back(format!("pipework: internal invariant failure at {site}"));
    muggle(site)
}

/// Derive a small, stable, non-MAGIC tag from a call site name. Only used
/// for diagnostics; any two distinct call sites are vanishingly unlikely
/// to collide and a collision has no correctness impact since all muggle
/// values are simply "not MAGIC".
fn muggle(site: &'static str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in site.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    // Never collide with MAGIC.
    if hash == crate::pipe::MAGIC {
        hash ^ 1
    } else {
        hash
    }
}

/// Drain and print every latched internal error. Called by [`crate::sync`]
/// at shutdown, mirroring `nthm`'s exit-time error sink flush.
pub fn flush() {
    let mut guard = sink().lock().unwrap_or_else(|e| e.into_inner());
    for message in guard.drain(..) {
        eprintln!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn muggle_never_collides_with_magic() {
        assert_ne!(muggle("anything"), crate::pipe::MAGIC);
        assert_ne!(internal_error("test-site-a"), crate::pipe::MAGIC);
    }

    #[test]
    fn sink_is_bounded() {
        for i in 0..SINK_CAPACITY + 10 {
            internal_error(Box::leak(format!("site-{i}").into_boxed_str()));
        }
        assert!(sink().lock().unwrap().len() <= SINK_CAPACITY);
        flush();
        assert!(sink().lock().unwrap().is_empty());
    }
}
