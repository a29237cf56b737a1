//! Live rate limiter overrides.
//!
//! An external refresher replaces the whole [`DynamicConfiguration`] at once.
//! Readers load the current snapshot without locking and always see one
//! snapshot in full.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::RateLimiterConfig;
use super::error::ConfigurationError;

/// A snapshot of operator-supplied overrides, keyed by descriptor id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfiguration {
    /// An explicit `null` is the same as no entry.
    #[serde(default)]
    limits: HashMap<String, Option<RateLimiterConfig>>,
}

impl DynamicConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the override for a descriptor id.
    pub fn with_limit(mut self, id: impl Into<String>, config: RateLimiterConfig) -> Self {
        self.limits.insert(id.into(), Some(config));
        self
    }

    /// The override for a descriptor id, if any.
    pub fn limit(&self, id: &str) -> Option<&RateLimiterConfig> {
        self.limits.get(id).and_then(Option::as_ref)
    }

    /// Descriptor ids that carry an override.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.limits
            .iter()
            .filter(|(_, config)| config.is_some())
            .map(|(id, _)| id.as_str())
    }

    /// Parse a snapshot from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Parse a snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Read a snapshot from a file; `.json` files are JSON, anything else YAML.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConfigurationError::Parse(format!("failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }
}

/// Shared handle to the current [`DynamicConfiguration`].
///
/// Clones share the same snapshot slot. Once a registry has registered its
/// descriptors, every snapshot installed is checked against them and
/// overrides that will never apply are logged.
#[derive(Debug, Clone, Default)]
pub struct DynamicConfigurationManager {
    inner: Arc<ArcSwap<DynamicConfiguration>>,
    /// Descriptor id to dynamic-eligibility
    descriptors: Arc<RwLock<HashMap<&'static str, bool>>>,
}

impl DynamicConfigurationManager {
    pub fn new(initial: DynamicConfiguration) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
            descriptors: Arc::default(),
        }
    }

    /// Record the descriptors reading this handle and check the current
    /// snapshot against them.
    pub(crate) fn register_descriptors(
        &self,
        descriptors: impl IntoIterator<Item = (&'static str, bool)>,
    ) {
        self.descriptors.write().extend(descriptors);
        self.report_ignored(&self.current());
    }

    /// Ids in `snapshot` whose override is ignored: unknown to every
    /// registered descriptor, or naming a non-dynamic one.
    ///
    /// Empty until descriptors are registered.
    pub fn ignored_ids(&self, snapshot: &DynamicConfiguration) -> Vec<String> {
        let descriptors = self.descriptors.read();
        if descriptors.is_empty() {
            return Vec::new();
        }

        let mut ignored: Vec<String> = snapshot
            .ids()
            .filter(|id| descriptors.get(*id) != Some(&true))
            .map(str::to_string)
            .collect();
        ignored.sort();
        ignored
    }

    fn report_ignored(&self, snapshot: &DynamicConfiguration) {
        for id in self.ignored_ids(snapshot) {
            match self.descriptors.read().get(id.as_str()) {
                Some(_) => warn!(id = %id, "Dynamic override for non-dynamic rate limiter ignored"),
                None => warn!(id = %id, "Dynamic override for unknown rate limiter ignored"),
            }
        }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<DynamicConfiguration> {
        self.inner.load_full()
    }

    /// Replace the snapshot.
    pub fn set(&self, configuration: DynamicConfiguration) {
        self.report_ignored(&configuration);
        self.inner.store(Arc::new(configuration));
    }

    /// Resolve against the current snapshot without cloning it.
    pub(crate) fn with_current<T>(&self, f: impl FnOnce(&DynamicConfiguration) -> T) -> T {
        f(&self.inner.load())
    }

    /// Re-read `path` every `interval`, swapping in each snapshot that parses.
    ///
    /// A file that fails to load leaves the previous snapshot in place.
    pub fn spawn_file_refresher(&self, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        info!(
            path = %path.display(),
            interval = ?interval,
            "Starting dynamic configuration refresher"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the caller loaded the initial snapshot.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                manager.refresh_from_file(&path).await;
            }
        })
    }

    /// Load `path` once, keeping the current snapshot on failure.
    pub async fn refresh_from_file(&self, path: &Path) -> bool {
        match DynamicConfiguration::load(path).await {
            Ok(configuration) => {
                if *self.current() != configuration {
                    info!(
                        path = %path.display(),
                        overrides = configuration.ids().count(),
                        "Dynamic configuration updated"
                    );
                    self.set(configuration);
                } else {
                    debug!(path = %path.display(), "Dynamic configuration unchanged");
                }
                true
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to refresh dynamic configuration, keeping previous snapshot"
                );
                false
            }
        }
    }
}
