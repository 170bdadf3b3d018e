//! Process-level configuration for the store collaborator.
//!
//! The core has exactly one piece of environment coupling: the connection
//! string for the shared key/value+pubsub store, plus the key prefix that
//! namespaces every hash and channel this process touches. Everything else
//! (settings schema, driver authoring) is peripheral glue owned outside
//! this crate.

use std::env;

const REDIS_URL_VAR: &str = "REDIS_URL";
const PREFIX_VAR: &str = "DRIVER_CORE_PREFIX";

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_PREFIX: &str = "driver";

/// Runtime configuration for the store collaborator.
///
/// Constructed once at process start and shared as an injected
/// collaborator (spec design note: "no hidden singletons in test scope").
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub prefix: String,
}

impl Config {
    /// Read configuration from the environment, falling back to documented
    /// defaults when a variable is unset.
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var(REDIS_URL_VAR).unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            prefix: env::var(PREFIX_VAR).unwrap_or_else(|_| DEFAULT_PREFIX.to_string()),
        }
    }

    /// The status hash key for a given module id: `"<prefix>/<module_id>"`.
    pub fn hash_key(&self, module_id: &str) -> String {
        format!("{}/{}", self.prefix, module_id)
    }

    /// The pub/sub channel for a given module's status: `"<hash_key>/<status>"`.
    pub fn status_channel(&self, module_id: &str, status: &str) -> String {
        format!("{}/{}", self.hash_key(module_id), status)
    }

    /// The role-index lookup key used to resolve indirect subscriptions.
    pub fn role_key(&self, system_id: &str, role: &str, index: u32) -> String {
        format!("{}/roles/{}/{}/{}", self.prefix, system_id, role, index)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.prefix, "driver");
    }

    #[test]
    fn hash_and_channel_keys_are_prefixed() {
        let config = Config::default();
        assert_eq!(config.hash_key("m1"), "driver/m1");
        assert_eq!(config.status_channel("m1", "power"), "driver/m1/power");
        assert_eq!(config.role_key("S1", "Display", 1), "driver/roles/S1/Display/1");
    }
}
