//! Lock-record codec.
//!
//! A lock file's content is the only authority on who owns the lock. The
//! payload is exactly two newline-terminated text lines: the owner's pid as
//! decimal text, then the owner's machine identifier. This module is the pure
//! encode/decode transformation; it performs no I/O.

use crate::machine;
use thiserror::Error;

/// The persisted content of a lock file: the owner's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Process id of the owner.
    pub pid: u32,
    /// Machine identifier the owner recorded at acquisition time.
    pub machine_id: String,
}

/// Failure to parse lock file content.
///
/// A lock file with undecodable content is treated as unowned by the
/// acquisition path (logged and reclaimed), never respected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload did not contain exactly two lines.
    #[error("expected 2 lines, found {0}")]
    WrongLineCount(usize),

    /// The first line was not a decimal process id.
    #[error("pid line is not a decimal integer: '{0}'")]
    BadPid(String),

    /// The payload was not valid UTF-8 text.
    #[error("content is not valid UTF-8")]
    NotUtf8,
}

impl LockRecord {
    /// The identity of the current process on this machine.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            machine_id: machine::local_machine_id().to_string(),
        }
    }

    /// Encode this record into the two-line lock file payload.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}\n{}\n", self.pid, self.machine_id).into_bytes()
    }

    /// Decode a lock file payload. Exact inverse of [`LockRecord::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;

        let lines: Vec<&str> = text.lines().collect();
        if lines.len() != 2 {
            return Err(DecodeError::WrongLineCount(lines.len()));
        }

        let pid: u32 = lines[0]
            .parse()
            .map_err(|_| DecodeError::BadPid(lines[0].to_string()))?;

        Ok(Self {
            pid,
            machine_id: lines[1].to_string(),
        })
    }

    /// Whether this record names the current process on this machine.
    pub fn is_current_process(&self) -> bool {
        *self == Self::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_two_newline_terminated_lines() {
        let record = LockRecord {
            pid: 1234,
            machine_id: "abcdef0123456789".to_string(),
        };
        assert_eq!(record.encode(), b"1234\nabcdef0123456789\n");
    }

    #[test]
    fn decode_inverts_encode() {
        let record = LockRecord {
            pid: 98765,
            machine_id: "d41d8cd98f00b204".to_string(),
        };
        let decoded = LockRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_tolerates_missing_trailing_newline() {
        let decoded = LockRecord::decode(b"42\nsome-machine").unwrap();
        assert_eq!(decoded.pid, 42);
        assert_eq!(decoded.machine_id, "some-machine");
    }

    #[test]
    fn decode_rejects_empty_content() {
        assert_eq!(
            LockRecord::decode(b""),
            Err(DecodeError::WrongLineCount(0))
        );
    }

    #[test]
    fn decode_rejects_single_line() {
        assert_eq!(
            LockRecord::decode(b"1234\n"),
            Err(DecodeError::WrongLineCount(1))
        );
    }

    #[test]
    fn decode_rejects_extra_lines() {
        assert_eq!(
            LockRecord::decode(b"1\ntwo\nthree\n"),
            Err(DecodeError::WrongLineCount(3))
        );
    }

    #[test]
    fn decode_rejects_non_numeric_pid() {
        assert_eq!(
            LockRecord::decode(b"not-a-pid\nmachine\n"),
            Err(DecodeError::BadPid("not-a-pid".to_string()))
        );
    }

    #[test]
    fn decode_rejects_non_utf8() {
        assert_eq!(
            LockRecord::decode(&[0xff, 0xfe, b'\n', b'x', b'\n']),
            Err(DecodeError::NotUtf8)
        );
    }

    #[test]
    fn current_record_names_this_process() {
        let record = LockRecord::current();
        assert_eq!(record.pid, std::process::id());
        assert!(record.is_current_process());
    }

    #[test]
    fn record_for_other_pid_is_not_current_process() {
        let record = LockRecord {
            pid: std::process::id().wrapping_add(1),
            machine_id: crate::machine::local_machine_id().to_string(),
        };
        assert!(!record.is_current_process());
    }
}
