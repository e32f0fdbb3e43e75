//! Source-control backends.
//!
//! A [`SourceBackend`] performs the actual repository mechanics for one
//! remote: preparing the on-disk handle, enumerating environments, and the
//! network refresh itself. The locking and provider wrapper logic in
//! [`crate::provider`] stays backend-agnostic; backends never touch lock
//! files.
//!
//! [`GitBackend`] shells out to the `git` binary with captured output.
//! [`MockBackend`] records calls without any repository and backs the test
//! suites of the provider and registry layers.

use crate::error::{Result, SrcCacheError};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// The per-remote operations supplied by a source-control implementation.
pub trait SourceBackend: Send + Sync {
    /// Prepare the on-disk repository handle. Returns `true` when the handle
    /// was newly created, `false` when it already existed.
    fn init_remote(&self) -> Result<bool>;

    /// The environment names this remote provides (e.g. one per branch).
    fn envs(&self) -> Result<Vec<String>>;

    /// Perform the network refresh. Returns whether content changed.
    fn do_fetch(&self) -> Result<bool>;
}

/// Builds one backend per configured remote.
pub trait BackendFactory: Send + Sync {
    /// Create the backend for `locator`, caching under `cache_dir`.
    fn create(&self, locator: &str, cache_dir: &Path) -> Result<Box<dyn SourceBackend>>;
}

/// Git backend: a bare mirror under the remote's cache directory, refreshed
/// by shelling out to the `git` binary.
#[derive(Debug, Clone)]
pub struct GitBackend {
    locator: String,
    repo_dir: PathBuf,
}

impl GitBackend {
    /// Directory name of the bare mirror inside the cache directory; kept
    /// separate from the lock files that live at the cache-directory root.
    const REPO_DIR: &'static str = "repo";

    pub fn new(locator: &str, cache_dir: &Path) -> Self {
        Self {
            locator: locator.to_string(),
            repo_dir: cache_dir.join(Self::REPO_DIR),
        }
    }

    /// Run a git command in the mirror directory, failing on non-zero exit.
    fn git(&self, args: &[&str]) -> Result<GitOutput> {
        run_git(&self.repo_dir, args).map_err(|reason| SrcCacheError::Backend {
            locator: self.locator.clone(),
            reason,
        })
    }
}

impl SourceBackend for GitBackend {
    fn init_remote(&self) -> Result<bool> {
        if self.repo_dir.join("HEAD").exists() {
            return Ok(false);
        }

        std::fs::create_dir_all(&self.repo_dir).map_err(|e| {
            SrcCacheError::io(
                format!("failed to create cache directory '{}'", self.repo_dir.display()),
                e,
            )
        })?;
        self.git(&["init", "--bare", "--quiet"])?;
        self.git(&["remote", "add", "origin", &self.locator])?;
        debug!("initialized bare mirror for remote '{}'", self.locator);
        Ok(true)
    }

    fn envs(&self) -> Result<Vec<String>> {
        let output = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;

        let mut envs: Vec<String> = output
            .lines()
            .iter()
            .map(|branch| env_for_branch(branch))
            .collect();
        envs.sort();
        envs.dedup();
        Ok(envs)
    }

    fn do_fetch(&self) -> Result<bool> {
        // Mirror remote heads into local heads so envs() stays a local read.
        let output = self.git(&["fetch", "origin", "+refs/heads/*:refs/heads/*"])?;

        // git reports ref updates on stderr; silence means nothing changed.
        Ok(!output.stderr.is_empty())
    }
}

/// Map a branch name to its environment name. The default branch serves the
/// `base` environment.
fn env_for_branch(branch: &str) -> String {
    match branch {
        "master" | "main" => "base".to_string(),
        other => other.to_string(),
    }
}

/// Captured output of a successful git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout lines as a vector; empty stdout yields no lines.
    pub fn lines(&self) -> Vec<&str> {
        if self.stdout.is_empty() {
            Vec::new()
        } else {
            self.stdout.lines().collect()
        }
    }
}

/// Run a git command with the specified working directory.
fn run_git(cwd: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
    let output = Command::new("git")
        .current_dir(cwd)
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute git {}: {}", args.join(" "), e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(format!(
            "git {} failed with {}: {}",
            args.join(" "),
            output.status,
            if stderr.is_empty() { &stdout } else { &stderr }
        ));
    }

    Ok(GitOutput { stdout, stderr })
}

/// Factory for [`GitBackend`].
#[derive(Debug, Default)]
pub struct GitBackendFactory;

impl BackendFactory for GitBackendFactory {
    fn create(&self, locator: &str, cache_dir: &Path) -> Result<Box<dyn SourceBackend>> {
        Ok(Box::new(GitBackend::new(locator, cache_dir)))
    }
}

/// Backend that records calls without touching any repository.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    fetched: Arc<AtomicBool>,
    init_calls: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `do_fetch` has run since construction or the last reset.
    pub fn fetched(&self) -> bool {
        self.fetched.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.fetched.store(false, Ordering::SeqCst);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

impl SourceBackend for MockBackend {
    fn init_remote(&self) -> Result<bool> {
        // First call creates the handle, later calls find it in place.
        Ok(self.init_calls.fetch_add(1, Ordering::SeqCst) == 0)
    }

    fn envs(&self) -> Result<Vec<String>> {
        Ok(vec!["base".to_string()])
    }

    fn do_fetch(&self) -> Result<bool> {
        self.fetched.store(true, Ordering::SeqCst);
        Ok(true)
    }
}

/// Factory that hands out [`MockBackend`]s and keeps a handle to each one so
/// tests can observe per-remote fetch state.
#[derive(Debug, Default)]
pub struct MockBackendFactory {
    created: Mutex<Vec<(String, MockBackend)>>,
}

impl MockBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends created so far, in creation order, with their locators.
    pub fn instances(&self) -> Vec<(String, MockBackend)> {
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The backend created for `locator`, if any.
    pub fn backend_for(&self, locator: &str) -> Option<MockBackend> {
        self.instances()
            .into_iter()
            .find(|(l, _)| l == locator)
            .map(|(_, b)| b)
    }
}

impl BackendFactory for MockBackendFactory {
    fn create(&self, locator: &str, _cache_dir: &Path) -> Result<Box<dyn SourceBackend>> {
        let backend = MockBackend::new();
        self.created
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((locator.to_string(), backend.clone()));
        Ok(Box::new(backend))
    }
}
