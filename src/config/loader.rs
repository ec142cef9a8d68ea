//! Configuration Loader
//!
//! Environment-aware YAML loading: a base `dbaccess.yaml` plus an optional
//! `dbaccess.<environment>.yaml` overlay merged on top of it. Missing files
//! fall back to compiled defaults; malformed files are hard errors.

use super::DbAccessConfig;
use crate::error::{DbAccessError, Result};
use crate::logging::detect_environment;
use serde_yaml::Value as YamlValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const BASE_FILE: &str = "dbaccess.yaml";

/// Owns the loaded, validated configuration plus its provenance.
pub struct ConfigManager {
    config: DbAccessConfig,
    environment: String,
    config_directory: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration from `./config` with environment auto-detection.
    pub fn load() -> Result<Arc<ConfigManager>> {
        Self::load_from_directory(PathBuf::from("config"), &detect_environment())
    }

    /// Load from a specific directory with an explicit environment. Useful in
    /// tests, which should never mutate process-global environment variables.
    pub fn load_from_directory(
        config_dir: impl Into<PathBuf>,
        environment: &str,
    ) -> Result<Arc<ConfigManager>> {
        let config_directory = config_dir.into();
        let base_path = config_directory.join(BASE_FILE);

        let config = if base_path.exists() {
            let mut merged = read_yaml(&base_path)?;
            let overlay_path = config_directory.join(format!("dbaccess.{environment}.yaml"));
            if overlay_path.exists() {
                debug!(overlay = %overlay_path.display(), "applying environment overlay");
                merge_yaml(&mut merged, read_yaml(&overlay_path)?);
            }
            serde_yaml::from_value(merged)
                .map_err(|e| DbAccessError::Configuration(format!("invalid configuration: {e}")))?
        } else {
            debug!(
                directory = %config_directory.display(),
                "no configuration file found, using defaults"
            );
            DbAccessConfig::default()
        };

        config.validate()?;

        debug!(
            environment = %environment,
            replicas = config.instances.replicas.len(),
            pool_max = config.pool.max_connections,
            "configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Some(config_directory),
        }))
    }

    /// Wrap an already-built configuration (dependency injection path).
    pub fn from_config(config: DbAccessConfig, environment: &str) -> Result<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: None,
        }))
    }

    pub fn config(&self) -> &DbAccessConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> Option<&Path> {
        self.config_directory.as_deref()
    }
}

fn read_yaml(path: &Path) -> Result<YamlValue> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DbAccessError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&raw).map_err(|e| {
        DbAccessError::Configuration(format!("cannot parse {}: {e}", path.display()))
    })
}

/// Recursive mapping merge: overlay mappings merge key-by-key, every other
/// value kind replaces the base outright.
fn merge_yaml(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
