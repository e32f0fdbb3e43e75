//! Host identity and process liveness.
//!
//! The machine identifier is the second line of every lock record and is the
//! basis for deciding whether a recorded pid can be checked for liveness at
//! all: pid liveness is only meaningful for locks recorded against the local
//! machine id. Reading the identifier never fails; if the host cannot report
//! one, the sentinel [`MACHINE_ID_UNAVAILABLE`] is used instead.

use std::fs;
use std::sync::LazyLock;

/// Sentinel machine identifier used when the host cannot report one.
pub const MACHINE_ID_UNAVAILABLE: &str = "unavailable";

/// Files consulted for a stable machine identifier, in order.
const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

static MACHINE_ID: LazyLock<String> = LazyLock::new(read_machine_id);

/// The stable identifier of the local machine.
///
/// Read once per process: the systemd machine-id files are tried first, then
/// the hostname, then the `"unavailable"` sentinel. Never fails.
pub fn local_machine_id() -> &'static str {
    &MACHINE_ID
}

fn read_machine_id() -> String {
    for path in MACHINE_ID_PATHS {
        if let Ok(content) = fs::read_to_string(path) {
            let id = content.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }

    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| MACHINE_ID_UNAVAILABLE.to_string())
}

/// Whether a process with the given pid is currently running on this machine.
///
/// Only meaningful when the lock record's machine id equals
/// [`local_machine_id`]. Never errors: pids that never existed or have already
/// exited simply report `false`, favoring reclaim of dead locks over leaving
/// them stuck.
#[cfg(unix)]
pub fn is_pid_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0) probes for existence without delivering a signal.
    // EPERM means the process exists but belongs to another user.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Non-unix fallback: liveness cannot be probed, so report "not running" and
/// let the conservative reclaim policy favor availability.
#[cfg(not(unix))]
pub fn is_pid_running(_pid: u32) -> bool {
    false
}
