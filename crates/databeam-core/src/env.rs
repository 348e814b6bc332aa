//! Environment-backed configuration.
//!
//! Every module registers the variables it understands together with a
//! default; `get` never fails so startup code stays linear. Hard
//! requirements (`DB_ID`) are checked explicitly by the caller.

use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    values: HashMap<String, String>,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variable; the process environment wins over the default.
    pub fn add(&mut self, key: &str, default_value: &str) {
        let value = std::env::var(key).unwrap_or_else(|_| default_value.to_string());
        self.values.insert(key.to_string(), value);
    }

    /// Force a value, ignoring the process environment. Used for
    /// programmatic overrides and tests.
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    /// Look up a registered variable. Unregistered keys yield an empty
    /// string and a warning, mirroring the "log and keep going" policy of
    /// the rest of the platform.
    pub fn get(&self, key: &str) -> String {
        match self.values.get(key) {
            Some(v) => v.clone(),
            None => {
                warn!(key, "environment variable was never registered");
                String::new()
            }
        }
    }

    /// The standard set every module understands.
    pub fn with_module_defaults(module_name_default: &str) -> Self {
        let mut env = Self::new();
        env.add("MODULE_NAME", module_name_default);
        env.add("LOGLEVEL", "DEBUG");
        env.add("DATA_DIR", "/opt/databeam/data");
        env.add("CONFIG_DIR", "/opt/databeam/config");
        env.add("DEPLOY_VERSION", "latest");
        env.add("DB_ID", "");
        env.add("DB_ROUTER", "localhost");
        env.add("DB_ROUTER_FRONTEND_PORT", "5555");
        env.add("DB_ROUTER_BACKEND_PORT", "5556");
        env.add("DB_ROUTER_SUB_PORT", "5557");
        env.add("DB_ROUTER_PUB_PORT", "5558");
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_applies_when_unset() {
        let mut env = EnvConfig::new();
        env.add("DATABEAM_TEST_UNSET_XYZ", "fallback");
        assert_eq!(env.get("DATABEAM_TEST_UNSET_XYZ"), "fallback");
    }

    #[test]
    fn process_environment_wins() {
        std::env::set_var("DATABEAM_TEST_SET_XYZ", "from-env");
        let mut env = EnvConfig::new();
        env.add("DATABEAM_TEST_SET_XYZ", "fallback");
        assert_eq!(env.get("DATABEAM_TEST_SET_XYZ"), "from-env");
        std::env::remove_var("DATABEAM_TEST_SET_XYZ");
    }

    #[test]
    fn unregistered_key_is_empty() {
        let env = EnvConfig::new();
        assert_eq!(env.get("NEVER_REGISTERED"), "");
    }

    #[test]
    fn module_defaults_cover_router_ports() {
        let env = EnvConfig::with_module_defaults("Module");
        assert_eq!(env.get("DB_ROUTER_FRONTEND_PORT"), "5555");
        assert_eq!(env.get("DB_ROUTER_PUB_PORT"), "5558");
        assert_eq!(env.get("DEPLOY_VERSION"), "latest");
    }
}
