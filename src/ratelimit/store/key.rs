//! Composite bucket keys.

/// Prefix shared by every bucket key.
const KEY_PREFIX: &str = "leaky_bucket";

/// Identifies one bucket: a descriptor id paired with a caller key.
///
/// Descriptor ids never contain `:`, so the rendered key splits back into
/// its parts unambiguously even when the caller key does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    descriptor: &'static str,
    caller: String,
    rendered: String,
}

impl BucketKey {
    pub fn new(descriptor: &'static str, caller: &str) -> Self {
        Self {
            descriptor,
            caller: caller.to_string(),
            rendered: format!("{}::{}::{}", KEY_PREFIX, descriptor, caller),
        }
    }

    pub fn descriptor(&self) -> &'static str {
        self.descriptor
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// The key as written to the store.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}
