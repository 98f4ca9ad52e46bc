//! Environment layers
//!
//! The environment contributes three layers to the config-rs builder:
//! credentials as defaults beneath the deploy file, nested
//! `MODEL_SERVE_<SECTION>__<FIELD>` variables above it, and the documented
//! shortcut variables as overrides above everything. Variables come from a
//! map so tests can supply a fixed environment.

use std::collections::HashMap;
use config_rs::builder::DefaultState;
use config_rs::{ConfigBuilder, ConfigError, Environment};
use tracing::warn;

use common::utils::gigabytes_to_bytes;
use crate::defaults::*;

pub type Builder = ConfigBuilder<DefaultState>;

/// Prefix of the nested environment source
pub const ENV_PREFIX: &str = "MODEL_SERVE";

/// Separator between nested keys, as in `MODEL_SERVE_HTTP__READ_TIMEOUT_SECS`
pub const ENV_NESTED_SEPARATOR: &str = "__";

/// Snapshot of the process environment
pub fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

fn lookup<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Credentials from the environment, at lower precedence than the file
pub fn credential_defaults(mut builder: Builder, vars: &HashMap<String, String>) -> Result<Builder, ConfigError> {
    let credentials = [
        ("credentials.hub_token", ENV_HUB_TOKEN),
        ("credentials.object_store.access_key_id", ENV_ACCESS_KEY_ID),
        ("credentials.object_store.secret_access_key", ENV_SECRET_ACCESS_KEY),
        ("credentials.object_store.region", ENV_REGION),
    ];
    for (key, variable) in credentials {
        if let Some(value) = lookup(vars, variable) {
            builder = builder.set_default(key, value)?;
        }
    }
    Ok(builder)
}

/// Environment sources that win over the file
pub fn overrides(builder: Builder, vars: &HashMap<String, String>) -> Result<Builder, ConfigError> {
    let nested = Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator(ENV_NESTED_SEPARATOR)
        .ignore_empty(true)
        .try_parsing(true)
        .source(Some(nested_vars(vars)));

    let max_bytes = lookup(vars, ENV_CACHE_MAX_GB).and_then(|raw| match raw.parse::<f64>() {
        Ok(gb) if gb > 0.0 => Some(i64::try_from(gigabytes_to_bytes(gb)).unwrap_or(i64::MAX)),
        _ => {
            warn!(variable = ENV_CACHE_MAX_GB, value = %raw, "ignoring invalid cache budget");
            None
        }
    });

    builder
        .add_source(nested)
        .set_override_option("cache.root_dir", lookup(vars, ENV_CACHE_DIR))?
        .set_override_option("cache.max_bytes", max_bytes)?
        .set_override_option("log.level", lookup(vars, ENV_LOG_LEVEL))
}

/// Only the `MODEL_SERVE_*` variables that name a nested key
fn nested_vars(vars: &HashMap<String, String>) -> HashMap<String, String> {
    let prefix = format!("{}_", ENV_PREFIX);
    vars.iter()
        .filter(|(name, _)| {
            name.strip_prefix(&prefix)
                .map_or(false, |rest| rest.contains(ENV_NESTED_SEPARATOR))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ServeConfig;
    use std::path::PathBuf;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resolve(vars: &HashMap<String, String>) -> ServeConfig {
        let builder = credential_defaults(config_rs::Config::builder(), vars).unwrap();
        overrides(builder, vars)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_overrides_cache_and_log() {
        let vars = env(&[
            (ENV_CACHE_DIR, "/data/cache"),
            (ENV_CACHE_MAX_GB, "1.5"),
            (ENV_LOG_LEVEL, "debug"),
        ]);
        let config = resolve(&vars);

        assert_eq!(config.cache.root_dir, PathBuf::from("/data/cache"));
        assert_eq!(config.cache.max_bytes, 1_500_000_000);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_budget_is_ignored() {
        let config = resolve(&env(&[(ENV_CACHE_MAX_GB, "lots")]));
        assert_eq!(config.cache.max_bytes, ServeConfig::default().cache.max_bytes);

        let config = resolve(&env(&[(ENV_CACHE_MAX_GB, "-2")]));
        assert_eq!(config.cache.max_bytes, ServeConfig::default().cache.max_bytes);
    }

    #[test]
    fn test_nested_variables_reach_any_section() {
        let vars = env(&[
            ("MODEL_SERVE_HTTP__READ_TIMEOUT_SECS", "45"),
            ("MODEL_SERVE_HUB__ENDPOINT", "https://hub.internal"),
            ("MODEL_SERVE_LOG__JSON", "true"),
            // shortcut variables are not nested keys
            (ENV_DEPLOY_CONFIG, "/etc/deploy.yaml"),
        ]);
        let config = resolve(&vars);

        assert_eq!(config.http.read_timeout_secs, 45);
        assert_eq!(config.hub.endpoint, "https://hub.internal");
        assert!(config.log.json);
    }

    #[test]
    fn test_shortcut_wins_over_nested_variable() {
        let vars = env(&[
            ("MODEL_SERVE_CACHE__ROOT_DIR", "/nested"),
            (ENV_CACHE_DIR, "/shortcut"),
        ]);
        assert_eq!(resolve(&vars).cache.root_dir, PathBuf::from("/shortcut"));
    }

    #[test]
    fn test_credentials_fill_gaps() {
        let vars = env(&[(ENV_HUB_TOKEN, "from-env"), (ENV_ACCESS_KEY_ID, "id-env")]);
        let config = resolve(&vars);

        assert_eq!(config.credentials.hub_token.as_deref(), Some("from-env"));
        assert_eq!(
            config.credentials.object_store.access_key_id.as_deref(),
            Some("id-env")
        );
        assert!(config.credentials.object_store.region.is_none());
    }
}
