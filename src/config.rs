//! Pool configuration: defaults, YAML loading, and the deprecated-alias /
//! disk-cache-recycling validation.
//!
//! Serde derive with per-field defaults, falling back to
//! `Default::default()` when the config file is absent, splitting the
//! plain-data fields from the pluggable [`Launcher`] into two types since
//! a trait object cannot itself be deserialized.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::handle::{LaunchOptions, Launcher};

#[cfg(feature = "chromiumoxide")]
use crate::handle::chromiumoxide_handle::ChromiumLauncher;

fn default_max_open_pages_per_instance() -> usize {
    50
}

fn default_instance_killer_interval_millis() -> u64 {
    60_000
}

fn default_kill_instance_after_millis() -> u64 {
    300_000
}

const DEFAULT_RETIRE_INSTANCE_AFTER_REQUEST_COUNT: u32 = 100;

/// The subset of [`PoolConfig`] that can be expressed in YAML/JSON. The
/// `launcher` is always supplied programmatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPoolConfig {
    #[serde(default = "default_max_open_pages_per_instance")]
    pub max_open_pages_per_instance: usize,

    #[serde(default)]
    pub retire_instance_after_request_count: Option<u32>,

    /// Deprecated alias for `retire_instance_after_request_count`, honored
    /// only when the canonical key is absent.
    #[serde(default)]
    pub abort_instance_after_request_count: Option<u32>,

    #[serde(default = "default_instance_killer_interval_millis")]
    pub instance_killer_interval_millis: u64,

    #[serde(default = "default_kill_instance_after_millis")]
    pub kill_instance_after_millis: u64,

    #[serde(default)]
    pub launch_options: LaunchOptions,

    #[serde(default)]
    pub recycle_disk_cache: bool,
}

impl Default for RawPoolConfig {
    fn default() -> Self {
        Self {
            max_open_pages_per_instance: default_max_open_pages_per_instance(),
            retire_instance_after_request_count: None,
            abort_instance_after_request_count: None,
            instance_killer_interval_millis: default_instance_killer_interval_millis(),
            kill_instance_after_millis: default_kill_instance_after_millis(),
            launch_options: LaunchOptions::default(),
            recycle_disk_cache: false,
        }
    }
}

impl RawPoolConfig {
    fn resolve_retire_count(&self) -> u32 {
        match (
            self.retire_instance_after_request_count,
            self.abort_instance_after_request_count,
        ) {
            (Some(canonical), _) => canonical,
            (None, Some(deprecated)) => {
                warn!(
                    value = deprecated,
                    "`abort_instance_after_request_count` is deprecated; use `retire_instance_after_request_count`"
                );
                deprecated
            }
            (None, None) => DEFAULT_RETIRE_INSTANCE_AFTER_REQUEST_COUNT,
        }
    }

    fn into_pool_config(self, launcher: Arc<dyn Launcher>) -> PoolConfig {
        PoolConfig {
            max_open_pages_per_instance: self.max_open_pages_per_instance,
            retire_instance_after_request_count: self.resolve_retire_count(),
            instance_killer_interval: Duration::from_millis(self.instance_killer_interval_millis),
            kill_instance_after: Duration::from_millis(self.kill_instance_after_millis),
            launch_options: self.launch_options,
            recycle_disk_cache: self.recycle_disk_cache,
            launcher,
        }
    }
}

/// Runtime pool configuration.
#[derive(Clone)]
pub struct PoolConfig {
    pub max_open_pages_per_instance: usize,
    pub retire_instance_after_request_count: u32,
    pub instance_killer_interval: Duration,
    pub kill_instance_after: Duration,
    pub launch_options: LaunchOptions,
    pub recycle_disk_cache: bool,
    pub launcher: Arc<dyn Launcher>,
}

impl PoolConfig {
    /// Defaults matching the common-case pool, with an explicit launcher.
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        RawPoolConfig::default().into_pool_config(launcher)
    }

    pub fn from_yaml_str(yaml: &str, launcher: Arc<dyn Launcher>) -> Result<Self, serde_yaml::Error> {
        let raw: RawPoolConfig = serde_yaml::from_str(yaml)?;
        Ok(raw.into_pool_config(launcher))
    }

    pub fn from_json_str(json: &str, launcher: Arc<dyn Launcher>) -> Result<Self, serde_json::Error> {
        let raw: RawPoolConfig = serde_json::from_str(json)?;
        Ok(raw.into_pool_config(launcher))
    }

    /// Loads `path`, falling back to [`PoolConfig::new`] if the file is
    /// absent or fails to parse (logged as a warning either way). The
    /// format is chosen by extension (`.json` parses as JSON, anything
    /// else as YAML) since both accept the same keys, including the
    /// deprecated alias.
    pub fn from_yaml_file(path: impl AsRef<Path>, launcher: Arc<dyn Launcher>) -> Self {
        let path = path.as_ref();
        let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let parsed = if is_json {
                    Self::from_json_str(&contents, Arc::clone(&launcher)).map_err(|e| e.to_string())
                } else {
                    Self::from_yaml_str(&contents, Arc::clone(&launcher)).map_err(|e| e.to_string())
                };
                match parsed {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to parse pool config, using defaults");
                        Self::new(launcher)
                    }
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "pool config file not found, using defaults");
                Self::new(launcher)
            }
        }
    }

    /// Whether disk-cache recycling can actually be enabled for this
    /// configuration, per the headless-mode validation below. Does not
    /// mutate `self` — the caller (`BrowserPool::new`) decides what to do
    /// with a `false` result.
    pub fn can_recycle_disk_cache(&self) -> bool {
        if !self.recycle_disk_cache {
            return false;
        }
        if self.launch_options.is_effectively_headless() {
            warn!(
                "recycle_disk_cache is set but launch_options imply a headless run; \
                 disk-cache recycling is unsupported in headless Chromium and will be disabled \
                 for this pool"
            );
            return false;
        }
        true
    }
}

#[cfg(feature = "chromiumoxide")]
impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(Arc::new(ChromiumLauncher::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deprecated_alias_is_used_only_when_canonical_key_is_absent() {
        let raw: RawPoolConfig =
            serde_yaml::from_str("abort_instance_after_request_count: 7").unwrap();
        assert_eq!(raw.resolve_retire_count(), 7);

        let raw: RawPoolConfig = serde_yaml::from_str(
            "retire_instance_after_request_count: 3\nabort_instance_after_request_count: 7",
        )
        .unwrap();
        assert_eq!(raw.resolve_retire_count(), 3);
    }

    #[test]
    fn json_config_accepts_the_same_deprecated_alias() {
        struct NullLauncher;
        #[async_trait::async_trait]
        impl Launcher for NullLauncher {
            async fn launch(
                &self,
                _options: &LaunchOptions,
            ) -> Result<Box<dyn crate::handle::BrowserHandle>, crate::error::LaunchError> {
                unimplemented!()
            }
        }

        let config = PoolConfig::from_json_str(
            r#"{"abort_instance_after_request_count": 42}"#,
            Arc::new(NullLauncher),
        )
        .unwrap();
        assert_eq!(config.retire_instance_after_request_count, 42);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        struct NullLauncher;
        #[async_trait::async_trait]
        impl Launcher for NullLauncher {
            async fn launch(
                &self,
                _options: &LaunchOptions,
            ) -> Result<Box<dyn crate::handle::BrowserHandle>, crate::error::LaunchError> {
                unimplemented!()
            }
        }

        let config = PoolConfig::from_yaml_file("/nonexistent/path.yaml", Arc::new(NullLauncher));
        assert_eq!(config.max_open_pages_per_instance, 50);
        assert_eq!(config.retire_instance_after_request_count, 100);
    }

    #[test]
    fn recycling_is_rejected_for_headless_launch_options() {
        struct NullLauncher;
        #[async_trait::async_trait]
        impl Launcher for NullLauncher {
            async fn launch(
                &self,
                _options: &LaunchOptions,
            ) -> Result<Box<dyn crate::handle::BrowserHandle>, crate::error::LaunchError> {
                unimplemented!()
            }
        }

        let mut config = PoolConfig::new(Arc::new(NullLauncher));
        config.recycle_disk_cache = true;
        config.launch_options.headless = Some(true);
        assert!(!config.can_recycle_disk_cache());

        config.launch_options.headless = Some(false);
        assert!(config.can_recycle_disk_cache());
    }
}
