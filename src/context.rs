/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! Task-local storage of "the pipe associated with this task". Installed
//! before worker code runs and cleared after it returns; an unmanaged
//! task gets a placeholder pipe lazily, the first time it touches the
//! library.

use std::cell::RefCell;
use std::sync::Arc;

use crate::pipe::Pipe;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Pipe>>> = const { RefCell::new(None) };
}

/// The pipe associated with the calling task, if any.
pub(crate) fn current() -> Option<Arc<Pipe>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Identify a pipe with the calling task.
pub(crate) fn set(p: Arc<Pipe>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(p));
}

/// Identify no pipe with the calling task.
pub(crate) fn clear() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Return the existing pipe associated with the calling task, or create
/// one and pool it as a placeholder for an unmanaged thread. The
/// placeholder's descendants are the managed tasks this thread goes on
/// to `open`.
pub(crate) fn current_or_new() -> Arc<Pipe> {
    if let Some(p) = current() {
        return p;
    }
    let placeholder = Pipe::new(true);
    crate::pool::placed(&placeholder);
    set(Arc::clone(&placeholder));
    placeholder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_none() {
        clear();
        assert!(current().is_none());
    }

    #[test]
    fn current_or_new_is_idempotent_within_a_task() {
        clear();
        let a = current_or_new();
        let b = current_or_new();
        assert!(Arc::ptr_eq(&a, &b));
        clear();
    }
}
