//! The update lock: filesystem-backed mutual exclusion per (remote, lock kind).
//!
//! # Lock Files
//!
//! Lock files live at `<cache_dir>/<kind>.lk` and are created with
//! **create_new** semantics (atomic exclusive create), so whoever wins the
//! atomic create wins the lock. Content is the two-line identity payload from
//! [`crate::lockfile`]; the file's existence asserts ownership and its content
//! is the only authority on who the owner is.
//!
//! # Stale-Lock Reclaim
//!
//! An existing lock file is respected only while its recorded owner is a live
//! process on this machine. Corrupt content, a dead local pid, or a foreign
//! machine id all cause the file to be removed and acquisition retried.
//! Cross-host sharing of a cache directory is not a supported configuration,
//! so a foreign machine id is treated as a stale artifact rather than a live
//! peer.
//!
//! # In-Process Serialization
//!
//! A per-lock [`TimedMutex`] strictly orders concurrent acquire/release
//! attempts within one process before any of them touches the filesystem. The
//! guard honors the caller's deadline and surfaces [`SrcCacheError::Timeout`]
//! itself, so a hung holder cannot wedge the whole process.
//!
//! # RAII
//!
//! Acquisition returns a [`LockGuard`] that releases the lock on drop. Both
//! the guard and the crash-safety hook in [`crate::signals`] funnel through
//! the same release-if-owned logic, so normal and crash exits cannot diverge.

use crate::error::{Result, SrcCacheError};
use crate::lockfile::LockRecord;
use crate::machine;
use crate::signals;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sleep interval between acquisition attempts while a live local peer holds
/// the lock. Coarse enough to avoid filesystem-metadata thrashing under
/// contention, fine enough to keep acquisition latency low relative to
/// typical fetch durations.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default overall acquisition timeout used by providers.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Serialization-guard timeout for release and clear paths, which carry no
/// caller-supplied deadline.
const RELEASE_GUARD_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a dropped guard or the termination cleanup waits for the
/// serialization guard before releasing anyway.
pub(crate) const DROP_GUARD_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process mutex with deadline-bounded acquisition.
///
/// Plain `Mutex<bool>` plus `Condvar`; poisoning is ignored because the
/// protected state is a single flag that stays consistent across panics.
#[derive(Debug, Default)]
pub struct TimedMutex {
    held: Mutex<bool>,
    cv: Condvar,
}

impl TimedMutex {
    /// Try to acquire before `deadline`. Returns `false` on timeout.
    pub fn acquire_until(&self, deadline: Instant) -> bool {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        while *held {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timed_out) = self
                .cv
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(|poison| poison.into_inner());
            held = guard;
        }
        *held = true;
        true
    }

    /// Try to acquire within `timeout`. Returns `false` on timeout.
    pub fn acquire(&self, timeout: Duration) -> bool {
        self.acquire_until(Instant::now() + timeout)
    }

    /// Release the mutex and wake one waiter.
    pub fn release(&self) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        *held = false;
        self.cv.notify_one();
    }

    /// Acquire as an RAII guard, or `None` on timeout.
    fn guard_until(&self, deadline: Instant) -> Option<SerialGuard<'_>> {
        if self.acquire_until(deadline) {
            Some(SerialGuard(self))
        } else {
            None
        }
    }
}

/// RAII guard for [`TimedMutex`].
struct SerialGuard<'a>(&'a TimedMutex);

impl Drop for SerialGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// What the identity recorded in an existing lock file tells us about its
/// holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HolderClass {
    /// A live process on this machine holds the lock; it must be respected.
    LiveLocal,
    /// The recorded pid is not running on this machine: an abandoned lock
    /// from a crashed process.
    DeadLocal,
    /// Recorded against a different machine id; liveness cannot be checked,
    /// treated as reclaimable.
    Foreign,
}

/// Classify a decoded lock record against the local machine id, with an
/// injectable liveness probe.
pub(crate) fn classify_holder_with(
    record: &LockRecord,
    local_machine_id: &str,
    is_running: impl Fn(u32) -> bool,
) -> HolderClass {
    if record.machine_id != local_machine_id {
        HolderClass::Foreign
    } else if is_running(record.pid) {
        HolderClass::LiveLocal
    } else {
        HolderClass::DeadLocal
    }
}

fn classify_holder(record: &LockRecord) -> HolderClass {
    classify_holder_with(record, machine::local_machine_id(), machine::is_pid_running)
}

/// Outcome of an identity-checked release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock file was owned by this process and has been removed.
    Released,
    /// No lock file existed; duplicate cleanup calls land here.
    AlreadyUnlocked,
}

/// The mutual-exclusion primitive for one (remote, lock kind).
///
/// State machine: Unlocked -> Locked -> Unlocked, with acquisition and
/// release as the only transitions. One instance per (remote, kind) per
/// process; the registry's context map preserves that invariant across
/// repeated registry construction.
#[derive(Debug, Clone)]
pub struct UpdateLock {
    locator: String,
    role: String,
    kind: String,
    path: PathBuf,
    pub(crate) serial: Arc<TimedMutex>,
}

impl UpdateLock {
    /// Create the lock handle for `kind` under a remote's cache directory.
    pub fn new(cache_dir: &Path, kind: &str, locator: &str, role: &str) -> Self {
        Self {
            locator: locator.to_string(),
            role: role.to_string(),
            kind: kind.to_string(),
            path: cache_dir.join(format!("{kind}.lk")),
            serial: Arc::new(TimedMutex::default()),
        }
    }

    /// Path of the lock file.
    pub fn lock_file(&self) -> &Path {
        &self.path
    }

    /// The lock kind this handle guards (e.g. `"update"`).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Acquire the lock, waiting at most `timeout`.
    ///
    /// Stale, corrupt, and foreign-machine lock files are reclaimed
    /// internally and never surface as errors. Only contention against a
    /// verified-live local peer can exhaust the timeout, in which case the
    /// holder's lock file is left untouched.
    ///
    /// # Returns
    ///
    /// * `Ok(LockGuard)` - lock acquired; released on drop
    /// * `Err(SrcCacheError::Timeout)` - a live peer held the lock (or the
    ///   in-process guard) for the whole window
    /// * `Err(SrcCacheError::Io)` - unrecoverable filesystem failure
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        let deadline = started + timeout;

        let _serial = self
            .serial
            .guard_until(deadline)
            .ok_or_else(|| self.timeout_error(started))?;

        loop {
            match self.try_create() {
                Ok(()) => {
                    debug!(
                        "Set {} lock for {} remote '{}' on machine_id '{}'",
                        self.kind,
                        self.role,
                        self.locator,
                        machine::local_machine_id()
                    );
                    signals::register_held(self);
                    return Ok(LockGuard {
                        lock: self.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.inspect_and_maybe_reclaim()? {
                        // Reclaimed: retry the exclusive create immediately.
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(self.timeout_error(started));
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    std::thread::sleep(POLL_INTERVAL.min(remaining));
                }
                Err(e) => {
                    return Err(SrcCacheError::io(
                        format!("failed to create lock file '{}'", self.path.display()),
                        e,
                    ));
                }
            }
        }
    }

    /// Release the lock if this process owns it.
    ///
    /// Removing a lock file not owned by the caller is a coordination bug and
    /// is reported as [`SrcCacheError::NotOwned`], never silently ignored.
    /// Releasing an already-unlocked lock is a no-op.
    pub fn release(&self) -> Result<ReleaseOutcome> {
        self.release_with_guard_timeout(RELEASE_GUARD_TIMEOUT)
    }

    pub(crate) fn release_with_guard_timeout(
        &self,
        guard_timeout: Duration,
    ) -> Result<ReleaseOutcome> {
        let started = Instant::now();
        let _serial = self
            .serial
            .guard_until(started + guard_timeout)
            .ok_or_else(|| self.timeout_error(started))?;

        self.release_if_owned()
    }

    /// Forcibly clear the lock file regardless of acquisition state.
    ///
    /// Without `force` the removal is identity-checked exactly like
    /// [`UpdateLock::release`]. With `force` the file is removed no matter
    /// who owns it; intended for operator intervention only.
    pub fn clear(&self, force: bool) -> Result<ReleaseOutcome> {
        self.clear_with_guard_timeout(force, RELEASE_GUARD_TIMEOUT)
    }

    pub(crate) fn clear_with_guard_timeout(
        &self,
        force: bool,
        guard_timeout: Duration,
    ) -> Result<ReleaseOutcome> {
        let started = Instant::now();
        let _serial = self
            .serial
            .guard_until(started + guard_timeout)
            .ok_or_else(|| self.timeout_error(started))?;

        if !force {
            return self.release_if_owned();
        }

        match fs::read(&self.path) {
            Ok(bytes) => {
                match LockRecord::decode(&bytes) {
                    Ok(record) => warn!(
                        "Forcibly clearing {} lock for {} remote '{}' held by pid {} on machine_id '{}'",
                        self.kind, self.role, self.locator, record.pid, record.machine_id
                    ),
                    Err(_) => warn!(
                        "Forcibly clearing corrupt {} lock for {} remote '{}'",
                        self.kind, self.role, self.locator
                    ),
                }
                self.remove_lock_file()?;
                signals::unregister_held(&self.path);
                Ok(ReleaseOutcome::Released)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(ReleaseOutcome::AlreadyUnlocked)
            }
            Err(e) => Err(SrcCacheError::io(
                format!("failed to read lock file '{}'", self.path.display()),
                e,
            )),
        }
    }

    /// Remove the lock file if its content names the current process.
    ///
    /// Shared by normal release, guard drop, and the crash-safety hook so the
    /// exit paths cannot diverge.
    pub(crate) fn release_if_owned(&self) -> Result<ReleaseOutcome> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                signals::unregister_held(&self.path);
                return Ok(ReleaseOutcome::AlreadyUnlocked);
            }
            Err(e) => {
                return Err(SrcCacheError::io(
                    format!("failed to read lock file '{}'", self.path.display()),
                    e,
                ));
            }
        };

        let record = LockRecord::decode(&bytes).map_err(|e| SrcCacheError::CorruptLock {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if !record.is_current_process() {
            return Err(SrcCacheError::NotOwned {
                locator: self.locator.clone(),
                kind: self.kind.clone(),
                owner_pid: record.pid,
                owner_machine_id: record.machine_id,
            });
        }

        self.remove_lock_file()?;
        signals::unregister_held(&self.path);
        debug!(
            "Removed {} lock for {} remote '{}' on machine_id '{}'",
            self.kind,
            self.role,
            self.locator,
            machine::local_machine_id()
        );
        Ok(ReleaseOutcome::Released)
    }

    /// Attempt the atomic create-exclusive of the lock file with this
    /// process's identity as content.
    fn try_create(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;

        let payload = LockRecord::current().encode();
        if let Err(e) = file.write_all(&payload).and_then(|()| file.sync_all()) {
            // A half-written lock file must not be left for peers to decode.
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }
        Ok(())
    }

    /// Inspect an existing lock file and reclaim it if its holder is stale.
    ///
    /// Returns `true` when the file was removed and the create should be
    /// retried immediately, `false` when a live local peer holds the lock.
    fn inspect_and_maybe_reclaim(&self) -> Result<bool> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            // Holder released between our create attempt and the read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(SrcCacheError::io(
                    format!("failed to read lock file '{}'", self.path.display()),
                    e,
                ));
            }
        };

        let record = match LockRecord::decode(&bytes) {
            Ok(record) => record,
            Err(decode_err) => {
                warn!(
                    "Corrupt {} lock file {} for {} remote '{}' ({}); removing it",
                    self.kind,
                    self.path.display(),
                    self.role,
                    self.locator,
                    decode_err
                );
                self.remove_stale()?;
                return Ok(true);
            }
        };

        let local_machine_id = machine::local_machine_id();
        match classify_holder(&record) {
            HolderClass::LiveLocal => Ok(false),
            HolderClass::DeadLocal => {
                warn!(
                    "{} lock file {} is present for {} remote '{}' on machine_id '{}' with pid \
                     '{}', but that process is not running. The update may have been interrupted; \
                     as the machine ids match, the lock will be reallocated",
                    self.kind,
                    self.path.display(),
                    self.role,
                    self.locator,
                    local_machine_id,
                    record.pid
                );
                self.remove_stale()?;
                Ok(true)
            }
            HolderClass::Foreign => {
                warn!(
                    "{} lock file {} is present for {} remote '{}': pid '{}' obtained the lock \
                     for machine_id '{}', current machine_id '{}'. Liveness cannot be checked \
                     across hosts; removing the lock",
                    self.kind,
                    self.path.display(),
                    self.role,
                    self.locator,
                    record.pid,
                    record.machine_id,
                    local_machine_id
                );
                self.remove_stale()?;
                Ok(true)
            }
        }
    }

    /// Remove a stale or corrupt lock file; a concurrent reclaimer winning
    /// the removal race is not an error.
    fn remove_stale(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SrcCacheError::io(
                format!("failed to remove stale lock file '{}'", self.path.display()),
                e,
            )),
        }
    }

    fn remove_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SrcCacheError::io(
                format!("failed to remove lock file '{}'", self.path.display()),
                e,
            )),
        }
    }

    fn timeout_error(&self, started: Instant) -> SrcCacheError {
        SrcCacheError::Timeout {
            locator: self.locator.clone(),
            kind: self.kind.clone(),
            waited_ms: started.elapsed().as_millis(),
        }
    }
}

/// RAII guard for an acquired [`UpdateLock`].
///
/// Dropping the guard releases the lock. If the lock file has already been
/// removed by a duplicate cleanup (e.g. the crash-safety hook), the drop is a
/// silent no-op; any other release failure is logged but does not panic.
#[derive(Debug)]
pub struct LockGuard {
    lock: UpdateLock,
    released: bool,
}

impl LockGuard {
    /// Path to the lock file this guard owns.
    pub fn path(&self) -> &Path {
        self.lock.lock_file()
    }

    /// Release the lock explicitly, surfacing errors to the caller.
    ///
    /// Idempotent with respect to "already unlocked": a lock file removed by
    /// a racing cleanup is not an error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release().map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best effort: if the serialization guard stays busy past the drop
        // window, release anyway rather than leave the file stuck.
        let serialized = self
            .lock
            .serial
            .acquire(DROP_GUARD_TIMEOUT);
        let result = self.lock.release_if_owned();
        if serialized {
            self.lock.serial.release();
        }
        if let Err(e) = result {
            warn!(
                "failed to release lock '{}' on drop: {}",
                self.lock.lock_file().display(),
                e
            );
        }
    }
}
