//! Construction and startup validation of the rate limiter registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::config::RateLimiterConfig;
use super::descriptor::{For, RateLimiterDescriptor};
use super::dynamic::DynamicConfigurationManager;
use super::error::ConfigurationError;
use super::limiter::RateLimiter;
use super::store::BucketStore;

/// Default bound on a single bucket store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Runtime collaborators shared by every limiter in a registry.
#[derive(Clone)]
pub struct RateLimitersOptions {
    pub clock: Arc<dyn Clock>,
    pub timeout: Duration,
}

impl Default for RateLimitersOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// One [`RateLimiter`] per descriptor, built and validated at startup.
pub struct RateLimiters<D: RateLimiterDescriptor = For> {
    limiters: HashMap<D, Arc<RateLimiter>>,
    by_id: HashMap<&'static str, D>,
}

impl RateLimiters<For> {
    /// Build the production registry.
    pub fn create_and_validate(
        static_configs: &HashMap<String, RateLimiterConfig>,
        dynamic_configuration: DynamicConfigurationManager,
        store: Arc<dyn BucketStore>,
        options: RateLimitersOptions,
    ) -> Result<Self, ConfigurationError> {
        Self::with_descriptors(&For::ALL, static_configs, dynamic_configuration, store, options)
    }
}

impl<D: RateLimiterDescriptor> RateLimiters<D> {
    /// Build a registry for an arbitrary descriptor set.
    ///
    /// Fails when an id is duplicated or malformed, when a static config names
    /// no descriptor, or when any default or static config is not positive.
    pub fn with_descriptors(
        descriptors: &[D],
        static_configs: &HashMap<String, RateLimiterConfig>,
        dynamic_configuration: DynamicConfigurationManager,
        store: Arc<dyn BucketStore>,
        options: RateLimitersOptions,
    ) -> Result<Self, ConfigurationError> {
        validate_descriptors(descriptors, static_configs)?;

        dynamic_configuration
            .register_descriptors(descriptors.iter().map(|d| (d.id(), d.is_dynamic())));

        let mut limiters = HashMap::with_capacity(descriptors.len());
        let mut by_id = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let base_config = static_configs
                .get(descriptor.id())
                .copied()
                .unwrap_or_else(|| descriptor.default_config());

            debug!(
                descriptor = descriptor.id(),
                dynamic = descriptor.is_dynamic(),
                bucket_size = base_config.bucket_size(),
                interval = ?base_config.permit_regeneration_interval(),
                "Configured rate limiter"
            );

            let limiter = RateLimiter::new(
                descriptor.id(),
                descriptor.is_dynamic(),
                base_config,
                dynamic_configuration.clone(),
                store.clone(),
                options.clock.clone(),
                options.timeout,
            );
            limiters.insert(*descriptor, Arc::new(limiter));
            by_id.insert(descriptor.id(), *descriptor);
        }

        info!(
            limiters = limiters.len(),
            static_overrides = static_configs.len(),
            "Rate limiters initialized"
        );

        Ok(Self { limiters, by_id })
    }

    /// The limiter for a descriptor, or `None` when the registry was built
    /// without it.
    pub fn get(&self, descriptor: D) -> Option<Arc<RateLimiter>> {
        self.limiters.get(&descriptor).cloned()
    }

    /// The limiter for a descriptor id.
    pub fn by_id(&self, id: &str) -> Option<Arc<RateLimiter>> {
        self.by_id.get(id).and_then(|d| self.get(*d))
    }

    /// Every descriptor in the registry.
    pub fn descriptors(&self) -> impl Iterator<Item = D> + '_ {
        self.limiters.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

fn is_well_formed_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(':') && !id.chars().any(char::is_whitespace)
}

/// Check the descriptor set and static overrides.
pub fn validate_descriptors<D: RateLimiterDescriptor>(
    descriptors: &[D],
    static_configs: &HashMap<String, RateLimiterConfig>,
) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let id = descriptor.id();
        if !is_well_formed_id(id) {
            return Err(ConfigurationError::MalformedId(id.to_string()));
        }
        if !seen.insert(id) {
            return Err(ConfigurationError::DuplicateId(id.to_string()));
        }

        descriptor
            .default_config()
            .validate()
            .map_err(|e| ConfigurationError::InvalidDescriptorConfig {
                id: id.to_string(),
                reason: format!("default: {}", e),
            })?;
    }

    for (id, config) in static_configs {
        if !seen.contains(id.as_str()) {
            return Err(ConfigurationError::UnknownDescriptor(id.clone()));
        }
        config
            .validate()
            .map_err(|e| ConfigurationError::InvalidDescriptorConfig {
                id: id.clone(),
                reason: format!("static override: {}", e),
            })?;
    }

    Ok(())
}
