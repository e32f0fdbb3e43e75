//! Shared test fixtures.

use std::io::{self, Write};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::subscriber::DefaultGuard;

/// A pid that is guaranteed not to name a running process: spawn a short
/// child and reap it before returning its pid.
pub(crate) fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("failed to spawn");
    let pid = child.id();
    child.wait().expect("failed to wait for child");
    pid
}

/// In-memory log sink for asserting on emitted log events.
///
/// Installs a thread-local tracing subscriber for the duration of the
/// captured closure, so parallel tests do not observe each other's events.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `f` with log capture active and return its result.
    pub(crate) fn capture<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.install();
        f()
    }

    fn install(&self) -> DefaultGuard {
        let writer = BufferWriter {
            buffer: Arc::clone(&self.buffer),
        };
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Everything logged so far, as UTF-8 text.
    pub(crate) fn text(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&buffer).to_string()
    }
}

#[derive(Clone)]
struct BufferWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
