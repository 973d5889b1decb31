//! YAML loading and normalisation.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{DiscoveryConfig, RoadmaskConfig};
use crate::validate::validate;

/// Load, normalise, and validate a configuration file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid YAML for the
/// model, or fails validation.
pub fn load_from_path(path: &Path) -> ConfigResult<RoadmaskConfig> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: RoadmaskConfig =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
    debug!(path = %path.display(), "configuration loaded");
    finish(config)
}

/// Parse, normalise, and validate an in-memory YAML document.
///
/// # Errors
///
/// Returns an error if the document does not parse or fails validation.
pub fn from_yaml_str(raw: &str) -> ConfigResult<RoadmaskConfig> {
    let config: RoadmaskConfig =
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse { path: None, source })?;
    finish(config)
}

fn finish(mut config: RoadmaskConfig) -> ConfigResult<RoadmaskConfig> {
    normalize(&mut config);
    validate(&config)?;
    Ok(config)
}

fn normalize(config: &mut RoadmaskConfig) {
    normalize_extensions(&mut config.discovery.supported_extensions);
    normalize_extensions(&mut config.discovery.excluded_extensions);
    for class in &mut config.masking.masked_classes {
        *class = class.trim().to_ascii_lowercase();
    }
    config.masking.masked_classes.retain(|class| !class.is_empty());
}

fn normalize_extensions(extensions: &mut Vec<String>) {
    let mut normalized: Vec<String> = Vec::with_capacity(extensions.len());
    for ext in extensions.drain(..) {
        if let Some(ext) = DiscoveryConfig::normalize_extension(&ext)
            && !normalized.contains(&ext)
        {
            normalized.push(ext);
        }
    }
    *extensions = normalized;
}
