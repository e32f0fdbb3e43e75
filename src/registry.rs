//! Remote registry: the ordered provider collection for one role.
//!
//! The registry owns one [`RemoteProvider`] per configured remote entry, in
//! insertion order, and resolves an update request to the subset of providers
//! to refresh. Remotes are independent: a failure on one never aborts the
//! others, and non-matching remotes are left completely untouched.
//!
//! [`RegistryMap`] is an explicit object owned by whoever bootstraps the
//! service, mapping opaque [`ContextHandle`]s to their registries, with
//! lifecycle tied to explicit init/teardown calls rather than any
//! process-global singleton.

use crate::backend::BackendFactory;
use crate::config::RemoteConfig;
use crate::error::{Result, SrcCacheError};
use crate::provider::RemoteProvider;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Which remotes an update request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSelector {
    /// Refresh every configured remote.
    All,
    /// Refresh remotes whose configured name or locator equals the string.
    NameOrLocator(String),
    /// Refresh remotes matching any (locator, name) pair; a `None` or empty
    /// name matches by locator alone.
    Pairs(Vec<(String, Option<String>)>),
}

impl UpdateSelector {
    fn matches(&self, provider: &RemoteProvider) -> bool {
        match self {
            UpdateSelector::All => true,
            UpdateSelector::NameOrLocator(s) => {
                provider.name() == Some(s.as_str()) || provider.locator() == s
            }
            UpdateSelector::Pairs(pairs) => pairs.iter().any(|(locator, name)| {
                locator == provider.locator()
                    && name
                        .as_deref()
                        .filter(|n| !n.is_empty())
                        .is_none_or(|n| provider.name() == Some(n))
            }),
        }
    }
}

impl From<&str> for UpdateSelector {
    fn from(s: &str) -> Self {
        UpdateSelector::NameOrLocator(s.to_string())
    }
}

impl From<Option<&str>> for UpdateSelector {
    fn from(s: Option<&str>) -> Self {
        match s {
            None => UpdateSelector::All,
            Some(s) => s.into(),
        }
    }
}

/// Result of one registry update pass.
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Locators fetched successfully, in dispatch order.
    pub fetched: Vec<String>,
    /// Locators whose fetch reported changed content.
    pub changed: Vec<String>,
    /// Per-remote failures; never aborts the remaining remotes.
    pub errors: Vec<(String, SrcCacheError)>,
}

impl UpdateReport {
    /// Whether every selected remote fetched successfully.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The ordered collection of configured remote providers for a role.
pub struct RemoteRegistry {
    role: String,
    providers: Vec<Arc<RemoteProvider>>,
}

impl RemoteRegistry {
    /// Build one provider per remote entry, preserving input order.
    pub fn new(
        role: &str,
        cache_root: &Path,
        remotes: Vec<RemoteConfig>,
        factory: &dyn BackendFactory,
    ) -> Result<Self> {
        let mut providers = Vec::with_capacity(remotes.len());
        for config in remotes {
            let provider = RemoteProvider::new(config, role, cache_root, factory)?;
            providers.push(Arc::new(provider));
        }
        Ok(Self {
            role: role.to_string(),
            providers,
        })
    }

    /// The role this registry serves (e.g. `"gitfs"`).
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Configured providers in insertion order.
    pub fn providers(&self) -> &[Arc<RemoteProvider>] {
        &self.providers
    }

    /// Refresh the remotes matching `selector`.
    ///
    /// All matching providers are fetched; non-matching providers are left
    /// untouched, including their lock state. A failure on one remote is
    /// recorded in the report and the remaining remotes still fetch.
    pub fn update(&self, selector: &UpdateSelector) -> UpdateReport {
        let mut report = UpdateReport::default();

        for provider in self.providers.iter().filter(|p| selector.matches(p)) {
            match provider.fetch() {
                Ok(changed) => {
                    debug!(
                        "fetched {} remote '{}' (changed: {})",
                        self.role,
                        provider.locator(),
                        changed
                    );
                    report.fetched.push(provider.locator().to_string());
                    if changed {
                        report.changed.push(provider.locator().to_string());
                    }
                }
                Err(e) => {
                    error!(
                        "failed to fetch {} remote '{}': {}",
                        self.role,
                        provider.locator(),
                        e
                    );
                    report.errors.push((provider.locator().to_string(), e));
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for RemoteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRegistry")
            .field("role", &self.role)
            .field("providers", &self.providers.len())
            .finish()
    }
}

/// Opaque handle identifying an execution context (scheduler, event loop,
/// test case) that owns a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(u64);

impl ContextHandle {
    /// Allocate a fresh handle, unique within this process.
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ContextHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Registries keyed by execution context.
///
/// Repeated registry construction within the same context reuses the
/// already-initialized providers instead of re-cloning and re-locking.
/// Entries are never shared across contexts and live until torn down.
#[derive(Debug, Default)]
pub struct RegistryMap {
    inner: Mutex<HashMap<ContextHandle, Arc<RemoteRegistry>>>,
}

impl RegistryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry for `context`, building it on first use.
    pub fn get_or_init(
        &self,
        context: ContextHandle,
        build: impl FnOnce() -> Result<RemoteRegistry>,
    ) -> Result<Arc<RemoteRegistry>> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(registry) = inner.get(&context) {
            return Ok(Arc::clone(registry));
        }
        let registry = Arc::new(build()?);
        inner.insert(context, Arc::clone(&registry));
        Ok(registry)
    }

    /// Tear down the registry for a context. Returns whether one existed.
    pub fn teardown(&self, context: ContextHandle) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&context)
            .is_some()
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Convenience: the cache root for a role under a base cache directory.
pub fn role_cache_root(cache_base: &Path, role: &str) -> PathBuf {
    cache_base.join(role)
}
