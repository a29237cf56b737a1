//! Rate limiting engine: descriptors, quota resolution and bucket enforcement.

mod clock;
mod config;
mod descriptor;
mod dynamic;
mod error;
mod limiter;
mod registry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RateLimiterConfig;
pub use descriptor::{For, RateLimiterDescriptor};
pub use dynamic::{DynamicConfiguration, DynamicConfigurationManager};
pub use error::{ConfigurationError, RateLimitError, StoreError};
pub use limiter::{effective_config, RateLimiter};
pub use registry::{validate_descriptors, RateLimiters, RateLimitersOptions, DEFAULT_STORE_TIMEOUT};
pub use store::{BucketStore, InMemoryBucketStore, RedisBucketStore};
