//! Remote provider: one configured remote source.
//!
//! A [`RemoteProvider`] pairs a [`SourceBackend`] with the update lock for
//! its cache directory. `fetch()` is the only path that refreshes a remote,
//! and it always runs under the `"update"` lock with release guaranteed on
//! every exit path; process death is covered by [`crate::signals`] and the
//! stale-lock reclaim in [`crate::lock`].
//!
//! The cache-directory basename is a pure function of the locator, so every
//! process in the fleet that refers to the same remote shares one cache
//! entry, and distinct remotes never collide.

use crate::backend::{BackendFactory, SourceBackend};
use crate::config::RemoteConfig;
use crate::error::Result;
use crate::lock::{LockGuard, ReleaseOutcome, UpdateLock};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock kind guarding remote refreshes.
pub const UPDATE_LOCK_KIND: &str = "update";

/// Deterministic cache-directory basename for a remote locator.
///
/// Stable across process restarts and across the fleet: the same locator
/// always maps to the same token, distinct locators to distinct tokens.
pub fn cache_basename(locator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(locator.as_bytes());
    // 8 digest bytes (16 hex chars) is plenty at registry scale.
    hex::encode(&hasher.finalize()[..8])
}

/// A single configured remote source and its update lock.
pub struct RemoteProvider {
    config: RemoteConfig,
    cache_dir: PathBuf,
    backend: Box<dyn SourceBackend>,
    update_lock: UpdateLock,
}

impl RemoteProvider {
    /// Build the provider for one remote, creating its backend and preparing
    /// the on-disk repository handle.
    pub fn new(
        config: RemoteConfig,
        role: &str,
        cache_root: &Path,
        factory: &dyn BackendFactory,
    ) -> Result<Self> {
        let cache_dir = cache_root.join(cache_basename(&config.locator));
        let backend = factory.create(&config.locator, &cache_dir)?;
        let update_lock = UpdateLock::new(&cache_dir, UPDATE_LOCK_KIND, &config.locator, role);

        let is_new = backend.init_remote()?;
        debug!(
            "initialized {} remote '{}' (new: {}) under '{}'",
            role,
            config.locator,
            is_new,
            cache_dir.display()
        );

        Ok(Self {
            config,
            cache_dir,
            backend,
            update_lock,
        })
    }

    /// The remote's source locator.
    pub fn locator(&self) -> &str {
        &self.config.locator
    }

    /// The remote's configured name alias, if any.
    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// The remote's cache directory (cache root joined with the basename).
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The deterministic cache-directory basename for this remote.
    pub fn get_cache_basename(&self) -> String {
        cache_basename(&self.config.locator)
    }

    /// The update lock for this remote.
    pub fn update_lock(&self) -> &UpdateLock {
        &self.update_lock
    }

    /// Acquire the update lock without fetching.
    pub fn lock(&self) -> Result<LockGuard> {
        self.update_lock.acquire(self.config.lock_timeout)
    }

    /// Remove this remote's update-lock file outside the acquire path.
    ///
    /// Identity-checked unless `force` is set; see [`UpdateLock::clear`].
    pub fn clear_lock(&self, force: bool) -> Result<ReleaseOutcome> {
        self.update_lock.clear(force)
    }

    /// The environment names this remote provides.
    pub fn envs(&self) -> Result<Vec<String>> {
        self.backend.envs()
    }

    /// Refresh this remote under its update lock.
    ///
    /// Returns whether content changed. The lock is released on every exit
    /// path: a backend failure propagates only after the release has run.
    pub fn fetch(&self) -> Result<bool> {
        let guard = self.lock()?;
        let fetch_result = self.backend.do_fetch();
        let release_result = guard.release();

        let changed = fetch_result?;
        release_result?;
        Ok(changed)
    }
}

impl std::fmt::Debug for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProvider")
            .field("locator", &self.config.locator)
            .field("name", &self.config.name)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockBackendFactory};
    use crate::error::SrcCacheError;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    fn mock_provider(locator: &str) -> (TempDir, RemoteProvider, MockBackend) {
        let cache_root = TempDir::new().unwrap();
        let factory = MockBackendFactory::new();
        let provider = RemoteProvider::new(
            RemoteConfig::bare(locator),
            "gitfs",
            cache_root.path(),
            &factory,
        )
        .unwrap();
        let backend = factory.backend_for(locator).unwrap();
        (cache_root, provider, backend)
    }

    #[test]
    fn cache_basename_is_pure_and_collision_free() {
        let a1 = cache_basename("file://repo1.git");
        let a2 = cache_basename("file://repo1.git");
        let b = cache_basename("file://repo2.git");

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 16);
        assert!(a1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn provider_basename_matches_free_function() {
        let (_root, provider, _backend) = mock_provider("file://repo1.git");
        assert_eq!(provider.get_cache_basename(), cache_basename("file://repo1.git"));
        assert!(provider.cache_dir().ends_with(provider.get_cache_basename()));
    }

    #[test]
    #[serial]
    fn fetch_runs_backend_and_leaves_lock_released() {
        let (_root, provider, backend) = mock_provider("file://repo1.git");

        assert!(provider.fetch().unwrap());
        assert!(backend.fetched());
        assert!(!provider.update_lock().lock_file().exists());

        // The in-process guard is free again too.
        let guard = provider.lock().unwrap();
        guard.release().unwrap();
    }

    #[test]
    #[serial]
    fn fetch_releases_lock_when_backend_fails() {
        struct FailingBackend;
        impl crate::backend::SourceBackend for FailingBackend {
            fn init_remote(&self) -> Result<bool> {
                Ok(true)
            }
            fn envs(&self) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            fn do_fetch(&self) -> Result<bool> {
                Err(SrcCacheError::Backend {
                    locator: "file://repo1.git".to_string(),
                    reason: "network unreachable".to_string(),
                })
            }
        }
        struct FailingFactory;
        impl crate::backend::BackendFactory for FailingFactory {
            fn create(
                &self,
                _locator: &str,
                _cache_dir: &Path,
            ) -> Result<Box<dyn crate::backend::SourceBackend>> {
                Ok(Box::new(FailingBackend))
            }
        }

        let cache_root = TempDir::new().unwrap();
        let provider = RemoteProvider::new(
            RemoteConfig::bare("file://repo1.git"),
            "gitfs",
            cache_root.path(),
            &FailingFactory,
        )
        .unwrap();

        let err = provider.fetch().unwrap_err();
        assert!(matches!(err, SrcCacheError::Backend { .. }));
        assert!(!provider.update_lock().lock_file().exists());

        // Lock is usable again after the failure.
        let guard = provider.lock().unwrap();
        guard.release().unwrap();
    }

    #[test]
    #[serial]
    fn fetch_times_out_while_lock_is_held() {
        let cache_root = TempDir::new().unwrap();
        let factory = MockBackendFactory::new();
        let mut config = RemoteConfig::bare("file://repo1.git");
        config.lock_timeout = Duration::from_millis(200);
        let provider =
            RemoteProvider::new(config, "gitfs", cache_root.path(), &factory).unwrap();

        let guard = provider.lock().unwrap();
        let err = provider.fetch().unwrap_err();
        assert!(matches!(err, SrcCacheError::Timeout { .. }));

        // The holder was not disturbed and the backend never ran.
        assert!(provider.update_lock().lock_file().exists());
        assert!(!factory.backend_for("file://repo1.git").unwrap().fetched());
        guard.release().unwrap();
    }

    #[test]
    #[serial]
    fn fetch_times_out_while_serialization_guard_is_hijacked() {
        let cache_root = TempDir::new().unwrap();
        let factory = MockBackendFactory::new();
        let mut config = RemoteConfig::bare("file://repo1.git");
        config.lock_timeout = Duration::from_millis(300);
        let provider =
            RemoteProvider::new(config, "gitfs", cache_root.path(), &factory).unwrap();

        // Hijack the in-process guard so the provider is fooled into
        // thinking another operation is mid-flight.
        assert!(provider.update_lock().serial.acquire(Duration::from_secs(5)));
        let err = provider.fetch().unwrap_err();
        assert!(matches!(err, SrcCacheError::Timeout { .. }));
        provider.update_lock().serial.release();

        // And the lock works once the guard is free.
        assert!(provider.fetch().is_ok());
    }

    #[test]
    #[serial]
    fn lock_and_clear_lock_round_trip() {
        let (_root, provider, _backend) = mock_provider("file://repo1.git");

        let guard = provider.lock().unwrap();
        assert!(provider.update_lock().lock_file().exists());
        guard.release().unwrap();
        assert!(!provider.update_lock().lock_file().exists());

        // clear_lock on an unlocked provider is a no-op.
        assert_eq!(
            provider.clear_lock(false).unwrap(),
            ReleaseOutcome::AlreadyUnlocked
        );
    }

    #[test]
    fn envs_delegate_to_backend() {
        let (_root, provider, _backend) = mock_provider("file://repo1.git");
        assert_eq!(provider.envs().unwrap(), vec!["base".to_string()]);
    }

    #[test]
    fn init_remote_runs_once_at_construction() {
        let (_root, _provider, backend) = mock_provider("file://repo1.git");
        assert_eq!(backend.init_calls(), 1);
    }
}
