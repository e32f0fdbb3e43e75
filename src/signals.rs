//! Crash-safety hook: release held locks on termination signals.
//!
//! Every successful acquisition registers its lock file in a process-wide
//! table; release removes it again. When the process receives SIGINT or
//! SIGTERM while entries remain, the watcher thread releases every lock still
//! owned by this process (identity-checked, never blind deletion) and then
//! re-raises the signal with the default disposition so the process still
//! dies with the expected status.
//!
//! The handler itself only writes one byte to a pipe (async-signal-safe); all
//! real work happens on the watcher thread. This is best-effort: SIGKILL
//! bypasses signal delivery entirely, which is why the stale-lock reclaim in
//! [`crate::lock`] is mandatory rather than optional hardening.

use crate::lock::{ReleaseOutcome, UpdateLock, DROP_GUARD_TIMEOUT};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, Once};
use tracing::{debug, warn};

/// Lock handles registered by acquisition, keyed by lock-file path. The
/// stored handle shares the live lock's serialization guard, so cleanup
/// releases go through the same guard as every other release.
static HELD_LOCKS: LazyLock<Mutex<HashMap<PathBuf, UpdateLock>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Record a lock this process now owns.
pub(crate) fn register_held(lock: &UpdateLock) {
    let mut held = HELD_LOCKS
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());
    held.insert(lock.lock_file().to_path_buf(), lock.clone());
}

/// Forget a lock file after release.
pub(crate) fn unregister_held(path: &Path) {
    let mut held = HELD_LOCKS
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());
    held.remove(path);
}

/// Number of lock files currently registered as held by this process.
pub fn held_lock_count() -> usize {
    HELD_LOCKS
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
        .len()
}

/// Release every lock this process still holds, by identity match.
///
/// This is the cleanup action the termination listener runs; it is also
/// callable directly by embedders that manage their own shutdown sequence.
/// Returns the number of locks actually released.
pub fn release_held_locks() -> usize {
    let entries: Vec<UpdateLock> = {
        let held = HELD_LOCKS
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        held.values().cloned().collect()
    };

    let mut released = 0;
    for lock in entries {
        let path = lock.lock_file().to_path_buf();
        // Bounded wait on the lock's own guard; if an operation stays wedged
        // past the window, release anyway rather than exit with the file stuck.
        let serialized = lock.serial.acquire(DROP_GUARD_TIMEOUT);
        let result = lock.release_if_owned();
        if serialized {
            lock.serial.release();
        }
        match result {
            Ok(ReleaseOutcome::Released) => {
                released += 1;
            }
            Ok(ReleaseOutcome::AlreadyUnlocked) => {
                debug!(
                    "lock '{}' already released before cleanup",
                    path.display()
                );
            }
            Err(e) => {
                warn!("failed to release lock '{}' during cleanup: {}", path.display(), e);
            }
        }
        unregister_held(&path);
    }
    released
}

#[cfg(unix)]
mod unix {
    use super::release_held_locks;
    use std::os::fd::FromRawFd;
    use std::sync::atomic::{AtomicI32, Ordering};

    static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

    /// Signal handler: forward the signal number through the self-pipe.
    /// Nothing else is async-signal-safe enough to run here.
    extern "C" fn forward_signal(sig: libc::c_int) {
        let fd = PIPE_WRITE_FD.load(Ordering::SeqCst);
        if fd >= 0 {
            let byte = sig as u8;
            unsafe {
                libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
            }
        }
    }

    pub(super) fn install() -> std::io::Result<()> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        PIPE_WRITE_FD.store(write_fd, Ordering::SeqCst);

        for sig in [libc::SIGINT, libc::SIGTERM] {
            let previous = unsafe { libc::signal(sig, forward_signal as libc::sighandler_t) };
            if previous == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }

        std::thread::Builder::new()
            .name("srccache-signal-watcher".to_string())
            .spawn(move || watch(read_fd))?;
        Ok(())
    }

    fn watch(read_fd: libc::c_int) {
        use std::io::Read;

        let mut pipe = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let mut buf = [0u8; 1];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => {
                    let sig = buf[0] as libc::c_int;
                    release_held_locks();
                    // Hand the signal back with the default disposition so
                    // the process exits with the expected status.
                    unsafe {
                        libc::signal(sig, libc::SIG_DFL);
                        libc::raise(sig);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}

static INSTALL: Once = Once::new();

/// Install the termination-signal listener, once per process.
///
/// Safe to call repeatedly; only the first call does anything. Callers that
/// never install the hook still get crash recovery from the stale-lock
/// reclaim path, just not prompt cleanup.
pub fn install_termination_hook() {
    INSTALL.call_once(|| {
        #[cfg(unix)]
        if let Err(e) = unix::install() {
            warn!("failed to install termination cleanup hook: {}", e);
        }
        #[cfg(not(unix))]
        debug!("termination cleanup hook not supported on this platform");
    });
}
