// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: cancel  —  cancellation token + subprocess registry
//
//  A single token is shared by every worker.  Cancellation sends SIGTERM to
//  all registered subprocesses, then SIGKILL to the survivors after a 3 s
//  grace period.  Workers observe the flag between subprocess invocations
//  and exit promptly; partial artifacts on disk are left in place.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const GRACE: Duration = Duration::from_secs(3);

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    live:      Mutex<HashSet<u32>>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Record a spawned subprocess so cancellation can reach it.
    pub fn register(&self, pid: u32) {
        self.inner.live.lock().unwrap().insert(pid);
    }

    /// Forget a subprocess after it has been waited on.
    pub fn unregister(&self, pid: u32) {
        self.inner.live.lock().unwrap().remove(&pid);
    }

    /// Trigger cancellation: TERM now, KILL whatever is still registered
    /// after the grace period.  Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let pids: Vec<u32> = self.inner.live.lock().unwrap().iter().copied().collect();
        for pid in &pids {
            send_term(*pid);
        }
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            std::thread::sleep(GRACE);
            let survivors: Vec<u32> = inner.live.lock().unwrap().iter().copied().collect();
            for pid in survivors {
                send_kill(pid);
            }
        });
    }
}

#[cfg(unix)]
fn send_term(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

// Off unix the workers still observe the flag between subprocesses; the
// in-flight compiler invocation is allowed to finish.
#[cfg(not(unix))]
fn send_term(_pid: u32) {}

#[cfg(not(unix))]
fn send_kill(_pid: u32) {}

// ─────────────────────────────────────────────────────────────────────────────
//  Ctrl-C wiring
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(unix)]
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_sig: libc::c_int) {
    // Only async-signal-safe work here: set the flag, nothing else.
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install a SIGINT handler that flips the token from a watcher thread.
#[cfg(unix)]
pub fn install_interrupt_watcher(token: CancelToken) {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            token.cancel();
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    });
}

#[cfg(not(unix))]
pub fn install_interrupt_watcher(_token: CancelToken) {}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent_and_visible() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn registry_tracks_pids() {
        let token = CancelToken::new();
        token.register(4242);
        token.unregister(4242);
        // A forgotten pid must never be signalled on cancel.
        token.cancel();
        assert!(token.is_cancelled());
    }
}
