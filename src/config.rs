//! Remote configuration entries.
//!
//! A registry is constructed from an ordered list of remote entries. Each
//! entry is either a bare locator string or a locator paired with a map of
//! per-remote override options, mirroring the YAML shape:
//!
//! ```yaml
//! - file://repo1.git
//! - file://repo2.git:
//!     name: repo2
//!     lock_timeout: 30
//! ```
//!
//! Entry order is preserved and significant for selection-by-index scenarios.
//! Override names are validated against [`RECOGNIZED_OVERRIDES`];
//! [`PER_REMOTE_ONLY`] names are rejected when supplied as global defaults.

use crate::error::{Result, SrcCacheError};
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Override option names accepted per remote.
pub const RECOGNIZED_OVERRIDES: [&str; 2] = ["name", "lock_timeout"];

/// Override option names only meaningful per remote, rejected as globals.
pub const PER_REMOTE_ONLY: [&str; 1] = ["name"];

/// One entry of the configured remote list, as parsed from YAML.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RemoteEntry {
    /// A bare locator with no overrides.
    Bare(String),
    /// A single-key map: locator to per-remote override options.
    WithOverrides(BTreeMap<String, BTreeMap<String, serde_json::Value>>),
}

/// Normalized configuration of one remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    /// Source locator (URL-like string); the remote's primary identity.
    pub locator: String,
    /// Optional human-readable alias, usable as an update selector.
    pub name: Option<String>,
    /// How long a fetch waits for the update lock.
    pub lock_timeout: Duration,
}

impl RemoteConfig {
    /// A remote with defaults and no alias.
    pub fn bare(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            name: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// A remote carrying a name alias.
    pub fn named(locator: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::bare(locator)
        }
    }

    /// Normalize a parsed entry, validating its override names and values.
    pub fn from_entry(entry: &RemoteEntry) -> Result<Self> {
        match entry {
            RemoteEntry::Bare(locator) => Ok(Self::bare(locator.clone())),
            RemoteEntry::WithOverrides(map) => {
                let mut entries = map.iter();
                let (locator, overrides) = match (entries.next(), entries.next()) {
                    (Some(entry), None) => entry,
                    _ => {
                        return Err(SrcCacheError::Config(format!(
                            "remote entry must map exactly one locator to its overrides, \
                             found {} keys",
                            map.len()
                        )));
                    }
                };
                let mut config = Self::bare(locator.clone());

                for (option, value) in overrides {
                    match option.as_str() {
                        "name" => {
                            config.name = Some(expect_string(locator, option, value)?);
                        }
                        "lock_timeout" => {
                            config.lock_timeout =
                                Duration::from_secs(expect_seconds(locator, option, value)?);
                        }
                        unknown => {
                            return Err(SrcCacheError::Config(format!(
                                "unrecognized override '{}' for remote '{}' \
                                 (recognized: {})",
                                unknown,
                                locator,
                                RECOGNIZED_OVERRIDES.join(", ")
                            )));
                        }
                    }
                }
                Ok(config)
            }
        }
    }
}

fn expect_string(locator: &str, option: &str, value: &serde_json::Value) -> Result<String> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        SrcCacheError::Config(format!(
            "override '{}' for remote '{}' must be a string, got: {}",
            option, locator, value
        ))
    })
}

fn expect_seconds(locator: &str, option: &str, value: &serde_json::Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| {
        SrcCacheError::Config(format!(
            "override '{}' for remote '{}' must be a non-negative integer of seconds, got: {}",
            option, locator, value
        ))
    })
}

/// Parse and normalize a YAML remote list, preserving input order.
pub fn parse_remotes(yaml: &str) -> Result<Vec<RemoteConfig>> {
    let entries: Vec<RemoteEntry> = serde_yaml::from_str(yaml)
        .map_err(|e| SrcCacheError::Config(format!("failed to parse remote list: {}", e)))?;
    entries.iter().map(RemoteConfig::from_entry).collect()
}

/// Validate a global-defaults option map: every name must be recognized and
/// must not be restricted to per-remote use.
pub fn validate_global_defaults(defaults: &BTreeMap<String, serde_json::Value>) -> Result<()> {
    for option in defaults.keys() {
        if PER_REMOTE_ONLY.contains(&option.as_str()) {
            return Err(SrcCacheError::Config(format!(
                "option '{}' is only valid per remote, not as a global default",
                option
            )));
        }
        if !RECOGNIZED_OVERRIDES.contains(&option.as_str()) {
            return Err(SrcCacheError::Config(format!(
                "unrecognized global default option '{}'",
                option
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_entry_uses_defaults() {
        let config = RemoteConfig::from_entry(&RemoteEntry::Bare("file://repo1.git".into())).unwrap();
        assert_eq!(config.locator, "file://repo1.git");
        assert_eq!(config.name, None);
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }

    #[test]
    fn parse_preserves_order_and_overrides() {
        let yaml = "\
- file://repo1.git
- file://repo2.git:
    name: repo2
    lock_timeout: 30
";
        let remotes = parse_remotes(yaml).unwrap();
        assert_eq!(remotes.len(), 2);
        assert_eq!(remotes[0].locator, "file://repo1.git");
        assert_eq!(remotes[0].name, None);
        assert_eq!(remotes[1].locator, "file://repo2.git");
        assert_eq!(remotes[1].name.as_deref(), Some("repo2"));
        assert_eq!(remotes[1].lock_timeout, Duration::from_secs(30));
    }

    #[test]
    fn unrecognized_override_is_rejected() {
        let yaml = "\
- file://repo1.git:
    frobnicate: true
";
        let err = parse_remotes(yaml).unwrap_err();
        assert!(matches!(err, SrcCacheError::Config(_)));
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn name_override_must_be_string() {
        let yaml = "\
- file://repo1.git:
    name: 42
";
        let err = parse_remotes(yaml).unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }

    #[test]
    fn lock_timeout_must_be_integer_seconds() {
        let yaml = "\
- file://repo1.git:
    lock_timeout: soon
";
        let err = parse_remotes(yaml).unwrap_err();
        assert!(err.to_string().contains("seconds"));
    }

    #[test]
    fn multi_key_entry_is_rejected() {
        let mut inner = BTreeMap::new();
        inner.insert("name".to_string(), serde_json::json!("x"));
        let mut map = BTreeMap::new();
        map.insert("file://a.git".to_string(), inner.clone());
        map.insert("file://b.git".to_string(), inner);

        let err = RemoteConfig::from_entry(&RemoteEntry::WithOverrides(map)).unwrap_err();
        assert!(err.to_string().contains("exactly one locator"));
    }

    #[test]
    fn global_defaults_reject_per_remote_only_names() {
        let mut defaults = BTreeMap::new();
        defaults.insert("name".to_string(), serde_json::json!("oops"));
        let err = validate_global_defaults(&defaults).unwrap_err();
        assert!(err.to_string().contains("only valid per remote"));
    }

    #[test]
    fn global_defaults_accept_recognized_shared_names() {
        let mut defaults = BTreeMap::new();
        defaults.insert("lock_timeout".to_string(), serde_json::json!(120));
        validate_global_defaults(&defaults).unwrap();
    }

    #[test]
    fn empty_list_parses_to_no_remotes() {
        assert!(parse_remotes("[]").unwrap().is_empty());
    }
}
