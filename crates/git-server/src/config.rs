//! Server configuration: loaded from the repository's own config files
//! (via `git-config`'s layered `ConfigSet`) plus `GITR_*` environment
//! overrides, the same layering C git itself uses for `GIT_CONFIG_*`.

use std::path::Path;

use git_config::{ConfigError, ConfigSet};

/// Server-wide policy, independent of any single repository's config.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Glob patterns (single trailing `*` supported) no push can update.
    pub protected_refs: Vec<String>,
    /// Whether a non-fast-forward update is rejected outright or allowed
    /// when the pushed command doesn't request `+`/force semantics.
    pub allow_non_fast_forward: bool,
    /// Max request body size accepted for `git-receive-pack`, in bytes.
    pub max_push_size: u64,
    /// Tier-migration policy knobs, surfaced here so an operator can
    /// tune them without recompiling `git-storage`.
    pub migration_max_age_in_hot_secs: i64,
    pub migration_min_access_count: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protected_refs: vec!["refs/heads/main".to_string(), "refs/heads/master".to_string()],
            allow_non_fast_forward: false,
            max_push_size: 2 * 1024 * 1024 * 1024,
            migration_max_age_in_hot_secs: 3600,
            migration_min_access_count: 2.0,
        }
    }
}

impl ServerConfig {
    /// Load from the repository's layered config, applying `GITR_*`
    /// environment overrides last (highest precedence).
    pub fn load(git_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let set = ConfigSet::load(git_dir)?;
        let mut config = ServerConfig::default();

        if let Some(refs) = set.get_all_strings("server.protectedref")?.into_iter().next() {
            config.protected_refs = refs.split(',').map(|s| s.trim().to_string()).collect();
        }
        config.allow_non_fast_forward =
            set.get_bool_or("server.allownonfastforward", config.allow_non_fast_forward)?;
        if let Some(size) = set.get_int("server.maxpushsize")? {
            config.max_push_size = size.max(0) as u64;
        }
        if let Some(age) = set.get_int("server.migrationmaxageinhot")? {
            config.migration_max_age_in_hot_secs = age;
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }
}

fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(val) = std::env::var("GITR_PROTECTED_REFS") {
        config.protected_refs = val.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Ok(val) = std::env::var("GITR_ALLOW_NON_FAST_FORWARD") {
        config.allow_non_fast_forward = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("GITR_MAX_PUSH_SIZE") {
        if let Ok(parsed) = val.parse() {
            config.max_push_size = parsed;
        }
    }
}
