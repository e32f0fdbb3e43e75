//! srccache: cross-process update coordination for a shared remote-source cache.
//!
//! Multiple independent OS processes (on the same host, or on hosts sharing a
//! filesystem) may need to refresh the same externally-hosted source repository
//! into a shared local cache directory. This crate guarantees that at most one
//! refresh per remote per lock kind proceeds at a time:
//!
//! - [`lockfile`] encodes the lock owner's identity (pid + machine id) into the
//!   lock file payload.
//! - [`machine`] reads the stable local machine identifier and answers whether
//!   a recorded pid is still running.
//! - [`lock`] implements the filesystem-backed [`lock::UpdateLock`] with
//!   stale-owner detection, crash recovery, and a bounded-retry timeout.
//! - [`provider`] wraps one configured remote: fetch-under-lock and the
//!   deterministic cache-directory basename.
//! - [`registry`] owns the ordered provider collection for a role and resolves
//!   update selectors to the subset of remotes to refresh.
//! - [`signals`] is the crash-safety hook: a termination signal releases any
//!   locks this process still holds before exit.

pub mod backend;
pub mod config;
pub mod error;
pub mod lock;
pub mod lockfile;
pub mod machine;
pub mod provider;
pub mod registry;
pub mod signals;

#[cfg(test)]
pub(crate) mod test_support;
