//! Cross-field validation for loaded configuration.

use std::path::Path;

use crate::defaults::{MAX_DILATION_RADIUS, MAX_WORKERS};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{DiscoveryConfig, RoadmaskConfig};

/// Extension of the metadata records written next to each output.
const RECORD_EXTENSION: &str = "json";

/// Validate a configuration document.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] for the first rule that fails.
pub fn validate(config: &RoadmaskConfig) -> ConfigResult<()> {
    validate_paths(config)?;
    validate_discovery(config)?;
    validate_masking(config)?;
    validate_io(config)?;
    validate_pipeline(config)
}

fn validate_paths(config: &RoadmaskConfig) -> ConfigResult<()> {
    let paths = &config.paths;
    if paths.input_root.as_os_str().is_empty() {
        return Err(ConfigError::invalid(
            "paths",
            "input_root",
            None,
            "must be set",
        ));
    }

    let mut roots: Vec<(&'static str, &Path)> = vec![("output_root", &paths.output_root)];
    if let Some(local) = &paths.archive.local_root {
        roots.push(("archive.local_root", local));
    }
    if let Some(remote) = &paths.archive.remote_root {
        roots.push(("archive.remote_root", remote));
    }
    if let Some(errors) = &paths.error_root {
        roots.push(("error_root", errors));
    }

    for (idx, &(field, root)) in roots.iter().enumerate() {
        check_mirror_root(field, root, &paths.input_root)?;
        // Mirrors write the same relative paths, so overlapping roots would
        // let one tree overwrite another (e.g. originals over masked output).
        if roots[..idx]
            .iter()
            .any(|(_, earlier)| overlaps(root, earlier))
        {
            return Err(ConfigError::invalid(
                "paths",
                field,
                Some(root.display().to_string()),
                "overlaps another output or archive root",
            ));
        }
    }
    Ok(())
}

fn check_mirror_root(field: &'static str, root: &Path, input_root: &Path) -> ConfigResult<()> {
    if root.as_os_str().is_empty() {
        return Err(ConfigError::invalid("paths", field, None, "must be set"));
    }
    if overlaps(root, input_root) {
        return Err(ConfigError::invalid(
            "paths",
            field,
            Some(root.display().to_string()),
            "must not overlap input_root",
        ));
    }
    Ok(())
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn validate_discovery(config: &RoadmaskConfig) -> ConfigResult<()> {
    let discovery = &config.discovery;
    if discovery.supported_extensions.is_empty() {
        return Err(ConfigError::invalid(
            "discovery",
            "supported_extensions",
            None,
            "must list at least one extension",
        ));
    }
    let supported: Vec<String> = discovery
        .supported_extensions
        .iter()
        .filter_map(|ext| DiscoveryConfig::normalize_extension(ext))
        .collect();
    if let Some(ext) = discovery
        .excluded_extensions
        .iter()
        .filter_map(|ext| DiscoveryConfig::normalize_extension(ext))
        .find(|ext| supported.contains(ext))
    {
        return Err(ConfigError::invalid(
            "discovery",
            "excluded_extensions",
            Some(ext),
            "overlaps supported_extensions",
        ));
    }
    if supported.iter().any(|ext| ext == RECORD_EXTENSION) {
        return Err(ConfigError::invalid(
            "discovery",
            "supported_extensions",
            Some(RECORD_EXTENSION.to_string()),
            "is reserved for metadata records",
        ));
    }
    if let Some(subdir) = discovery.only_subdirs.iter().find(|dir| dir.is_absolute()) {
        return Err(ConfigError::invalid(
            "discovery",
            "only_subdirs",
            Some(subdir.display().to_string()),
            "must be relative to input_root",
        ));
    }
    Ok(())
}

fn validate_masking(config: &RoadmaskConfig) -> ConfigResult<()> {
    let masking = &config.masking;
    if !(1..=1_000).contains(&masking.blur.strength) {
        return Err(ConfigError::invalid(
            "masking",
            "blur.strength",
            Some(masking.blur.strength.to_string()),
            "must be between 1 and 1000",
        ));
    }
    if masking.dilation_radius > MAX_DILATION_RADIUS {
        return Err(ConfigError::invalid(
            "masking",
            "dilation_radius",
            Some(masking.dilation_radius.to_string()),
            "must not exceed 255",
        ));
    }
    Ok(())
}

fn validate_io(config: &RoadmaskConfig) -> ConfigResult<()> {
    let io = &config.io;
    if io.retry_poll_ms == 0 {
        return Err(ConfigError::invalid(
            "io",
            "retry_poll_ms",
            Some("0".to_string()),
            "must be positive",
        ));
    }
    if io.retry_poll_ms > io.retry_timeout_ms {
        return Err(ConfigError::invalid(
            "io",
            "retry_poll_ms",
            Some(io.retry_poll_ms.to_string()),
            "must not exceed retry_timeout_ms",
        ));
    }
    Ok(())
}

fn validate_pipeline(config: &RoadmaskConfig) -> ConfigResult<()> {
    let pipeline = &config.pipeline;
    if !(1..=MAX_WORKERS).contains(&pipeline.workers) {
        return Err(ConfigError::invalid(
            "pipeline",
            "workers",
            Some(pipeline.workers.to_string()),
            "must be between 1 and 64",
        ));
    }
    if pipeline.progress_every == 0 {
        return Err(ConfigError::invalid(
            "pipeline",
            "progress_every",
            Some("0".to_string()),
            "must be positive",
        ));
    }
    if pipeline.eta_window == 0 {
        return Err(ConfigError::invalid(
            "pipeline",
            "eta_window",
            Some("0".to_string()),
            "must be positive",
        ));
    }
    if pipeline.delete_input_after_archive && !config.paths.archive.is_enabled() {
        return Err(ConfigError::invalid(
            "pipeline",
            "delete_input_after_archive",
            None,
            "requires an archive destination",
        ));
    }
    Ok(())
}
