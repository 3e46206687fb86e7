/*
    MIT License

    Copyright (c) 2020 Philipp Schuster
*/

//! Thread creation and the join relay.
//!
//! `std::thread::JoinHandle` is returned straight to the spawner, unlike
//! a pthread id, which any thread that knows it can join. That means the
//! "join whichever thread finishes next, however many are running" relay
//! race from the pthreads original doesn't translate literally: nothing
//! in a worker thread's own body can join *itself*. Instead, every
//! handle is pushed into a process-wide queue right after spawning, and
//! a worker finishing up calls [`reap_finished`], which opportunistically
//! joins whatever in the queue has already finished via
//! [`std::thread::JoinHandle::is_finished`] — never blocking, since a
//! handle only gets joined once `is_finished` says it won't wait.
//! [`synchronize`] and shutdown additionally drain the queue with a
//! blocking join, guaranteeing every spawned thread is joined exactly
//! once before the process can consider itself quiescent.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::errs::PipeError;

/// Tunable knobs for thread creation. `stack_size` mirrors the one
/// tuning parameter `nthm` exposes through its build-time configuration;
/// everything else about a worker's thread is left to the platform
/// default.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    pub stack_size: Option<usize>,
}

fn relay() -> &'static Mutex<VecDeque<JoinHandle<()>>> {
    static RELAY: OnceLock<Mutex<VecDeque<JoinHandle<()>>>> = OnceLock::new();
    RELAY.get_or_init(|| Mutex::new(VecDeque::new()))
}

/// Spawn a worker thread running `body`, under `config`'s stack size if
/// one was requested, and enqueue its handle in the relay.
pub(crate) fn spawn<F>(config: RuntimeConfig, body: F) -> Result<(), PipeError>
where
    F: FnOnce() + Send + 'static,
{
    let mut builder = std::thread::Builder::new();
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }
    let handle = builder.spawn(body).map_err(|e| {
        if e.kind() == std::io::ErrorKind::OutOfMemory {
            PipeError::OutOfMemory
        } else {
            PipeError::SpawnFailed
        }
    })?;
    reap_finished();
    relay()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push_back(handle);
    Ok(())
}

/// Join every handle in the relay that has already finished, without
/// blocking on any that hasn't. Called both after every spawn and at the
/// end of every worker's run, so the queue never grows past the number
/// of threads genuinely still running.
pub(crate) fn reap_finished() {
    let mut guard = relay().lock().unwrap_or_else(|e| e.into_inner());
    let mut still_running = VecDeque::with_capacity(guard.len());
    while let Some(handle) = guard.pop_front() {
        if handle.is_finished() {
            drop(guard);
            let _ = handle.join();
            guard = relay().lock().unwrap_or_else(|e| e.into_inner());
        } else {
            still_running.push_back(handle);
        }
    }
    *guard = still_running;
}

/// Block until every spawned thread has been joined. Used by both the
/// public `sync` operation and `shutdown`.
pub(crate) fn synchronize() {
    loop {
        let next = relay().lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match next {
            Some(handle) => {
                let _ = handle.join();
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_synchronize_joins_everything() {
        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&done);
        spawn(RuntimeConfig::default(), move || {
            flag.store(true, std::sync::atomic::Ordering::Release);
        })
        .unwrap();
        synchronize();
        assert!(done.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn reap_finished_does_not_block_on_running_threads() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        spawn(RuntimeConfig::default(), move || {
            let _ = rx.recv();
        })
        .unwrap();
        reap_finished();
        let _ = tx.send(());
        synchronize();
    }
}
