//! Cascading shutdown on SIGTERM.
//!
//! The signal handler only restores the default disposition and sets a flag.
//! A watcher thread started by [`Shutdown::install`] notices the flag and marks
//! the process as exiting. It then waits for any trial start in progress and
//! stops every registered trial process group: SIGTERM first, SIGKILL after
//! the grace period. Finally it re-raises SIGTERM so the process exits with
//! the conventional status.

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

static TERM_RECEIVED: AtomicBool = AtomicBool::new(false);

const WATCH_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

extern "C" fn on_sigterm(_sig: libc::c_int) {
    // SAFETY: signal(2) is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
    }
    TERM_RECEIVED.store(true, Ordering::SeqCst);
}

#[derive(Debug)]
pub struct Shutdown {
    what: String,
    grace: Duration,
    exiting: AtomicBool,
    children: Mutex<BTreeSet<u32>>,
    start_guard: Mutex<()>,
}

impl Shutdown {
    /// `what` names the stopping process in logs ("batch", "queue").
    pub fn new(what: impl Into<String>, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            what: what.into(),
            grace,
            exiting: AtomicBool::new(false),
            children: Mutex::new(BTreeSet::new()),
            start_guard: Mutex::new(()),
        })
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Registers a trial process. The pid must lead its own process group.
    pub fn register(&self, pid: u32) {
        self.lock_children().insert(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.lock_children().remove(&pid);
    }

    pub fn children(&self) -> Vec<u32> {
        self.lock_children().iter().copied().collect()
    }

    fn lock_children(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serializes trial starts within this process. Shutdown takes it before
    /// exiting so a start is never cut in half.
    pub fn start_guard(&self) -> MutexGuard<'_, ()> {
        self.start_guard.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Installs the SIGTERM handler and starts the watcher thread.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        let handler = on_sigterm as extern "C" fn(libc::c_int);
        // SAFETY: the handler only calls async-signal-safe functions.
        let prev = unsafe { libc::signal(libc::SIGTERM, handler as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(anyhow!(
                "installing SIGTERM handler: {}",
                std::io::Error::last_os_error()
            ));
        }
        let shutdown = Arc::clone(self);
        thread::Builder::new()
            .name("sweep-shutdown".to_string())
            .spawn(move || loop {
                if TERM_RECEIVED.load(Ordering::SeqCst) {
                    shutdown.terminate();
                    return;
                }
                thread::sleep(WATCH_INTERVAL);
            })?;
        Ok(())
    }

    fn terminate(&self) {
        let _start = self.stop_for_exit();
        info!(
            "Stopping {} (pending trials can be started as needed)",
            self.what
        );
        // SAFETY: the default disposition was restored by the handler.
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_DFL);
            libc::raise(libc::SIGTERM);
        }
    }

    /// Marks the process as exiting, waits out any start in progress and then
    /// stops registered trials. No trial can start while the returned guard is
    /// held.
    fn stop_for_exit(&self) -> MutexGuard<'_, ()> {
        self.exiting.store(true, Ordering::SeqCst);
        let start = self.start_guard();
        self.stop_children();
        start
    }

    /// Marks the process as exiting and stops registered trials. Returns the
    /// pids that had to be killed.
    pub fn stop_children(&self) -> Vec<u32> {
        self.exiting.store(true, Ordering::SeqCst);
        let pids = self.children();
        for pid in &pids {
            info!("Stopping trial (proc {})", pid);
            signal_group(*pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if pids.iter().all(|pid| !self.lock_children().contains(pid)) {
                return Vec::new();
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
        let survivors: Vec<u32> = pids
            .into_iter()
            .filter(|pid| self.lock_children().contains(pid))
            .collect();
        for pid in &survivors {
            warn!("Forcefully terminating trial (proc {})", pid);
            signal_group(*pid, libc::SIGKILL);
        }
        survivors
    }
}

/// Signals the process group led by `pid`, falling back to the process.
fn signal_group(pid: u32, sig: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain kill(2) calls on pids we spawned.
    unsafe {
        if libc::kill(-pid, sig) != 0 {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::{Command, ExitStatus};
    use std::sync::mpsc;

    fn spawn_registered(shutdown: &Arc<Shutdown>, script: &str) -> (u32, mpsc::Receiver<ExitStatus>) {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .spawn()
            .expect("spawn child");
        let pid = child.id();
        shutdown.register(pid);
        let (tx, rx) = mpsc::channel();
        let reaper = Arc::clone(shutdown);
        thread::spawn(move || {
            let status = child.wait().expect("wait child");
            reaper.unregister(pid);
            let _ = tx.send(status);
        });
        (pid, rx)
    }

    #[test]
    fn stops_children_gracefully() {
        let shutdown = Shutdown::new("batch", Duration::from_secs(10));
        let (_pid, rx) = spawn_registered(&shutdown, "sleep 30");
        assert!(!shutdown.is_exiting());

        let killed = shutdown.stop_children();
        assert!(killed.is_empty());
        assert!(shutdown.is_exiting());
        let status = rx.recv_timeout(Duration::from_secs(5)).expect("child exited");
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert!(shutdown.children().is_empty());
    }

    #[test]
    fn kills_children_that_ignore_sigterm() {
        let shutdown = Shutdown::new("batch", Duration::from_millis(300));
        let (pid, rx) = spawn_registered(&shutdown, "trap '' TERM; sleep 30");
        // Give the shell time to install its trap.
        thread::sleep(Duration::from_millis(200));

        let killed = shutdown.stop_children();
        assert_eq!(killed, vec![pid]);
        let status = rx.recv_timeout(Duration::from_secs(5)).expect("child killed");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn stop_waits_for_start_in_progress() {
        let shutdown = Shutdown::new("queue", Duration::from_secs(10));
        let start = shutdown.start_guard();

        let stopper = Arc::clone(&shutdown);
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let _guard = stopper.stop_for_exit();
            let _ = done_tx.send(());
        });
        while !shutdown.is_exiting() {
            thread::sleep(Duration::from_millis(10));
        }

        // The start finishes spawning and registering after stopping began.
        let (_pid, rx) = spawn_registered(&shutdown, "sleep 30");
        drop(start);

        done_rx.recv_timeout(Duration::from_secs(5)).expect("stop finished");
        let status = rx.recv_timeout(Duration::from_secs(5)).expect("child stopped");
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }
}
