//! Configuration Loader
//!
//! Environment-aware YAML loading. A base file provides the deployment's
//! settings; an optional per-environment overlay is deep-merged on top.
//! Missing files are not an error: defaults cover everything.
//!
//! Discovery rules:
//! - `AGENT_CORE_CONFIG` points at the base file, otherwise
//!   `config/agent-core.yaml` relative to the working directory.
//! - The environment comes from `AGENT_ENV`, then `APP_ENV`, defaulting
//!   to `development`.
//! - `<base-stem>.<environment>.yaml` next to the base file, when
//!   present, overrides base values key by key.

use serde_yaml::Value as YamlValue;
use std::env;
use std::path::{Path, PathBuf};

use super::AgentCoreConfig;
use crate::error::{AgentCoreError, Result};

/// Detect the current environment from environment variables
pub fn detect_environment() -> String {
    env::var("AGENT_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Load configuration using the discovery rules above
pub fn load_config() -> Result<AgentCoreConfig> {
    let base_path = env::var("AGENT_CORE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/agent-core.yaml"));
    load_config_from(&base_path, &detect_environment())
}

/// Load configuration from an explicit base path and environment
pub fn load_config_from(base_path: &Path, environment: &str) -> Result<AgentCoreConfig> {
    let mut merged = match read_yaml(base_path)? {
        Some(value) => value,
        None => YamlValue::Mapping(Default::default()),
    };

    if let Some(overlay_path) = overlay_path(base_path, environment) {
        if let Some(overlay) = read_yaml(&overlay_path)? {
            merge_yaml(&mut merged, overlay);
        }
    }

    let config: AgentCoreConfig = serde_yaml::from_value(merged)
        .map_err(|e| AgentCoreError::Configuration(format!("invalid configuration: {e}")))?;
    config.validate()?;
    Ok(config)
}

fn overlay_path(base_path: &Path, environment: &str) -> Option<PathBuf> {
    let stem = base_path.file_stem()?.to_str()?;
    Some(base_path.with_file_name(format!("{stem}.{environment}.yaml")))
}

fn read_yaml(path: &Path) -> Result<Option<YamlValue>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AgentCoreError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let value: YamlValue = serde_yaml::from_str(&raw).map_err(|e| {
        AgentCoreError::Configuration(format!("cannot parse {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

/// Deep-merge `overlay` onto `base`: mappings merge key by key, every
/// other value replaces wholesale.
fn merge_yaml(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.entry(key) {
                    serde_yaml::mapping::Entry::Occupied(mut occupied) => {
                        merge_yaml(occupied.get_mut(), overlay_value);
                    }
                    serde_yaml::mapping::Entry::Vacant(vacant) => {
                        vacant.insert(overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
