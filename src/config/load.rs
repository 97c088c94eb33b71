//! Loading quantizer configuration from YAML

use std::fs;
use std::path::Path;

use super::schema::QuantizerConfig;
use super::validate::validate_config;
use crate::error::{Error, Result};

/// Parse and validate a quantizer configuration from YAML text
pub fn parse_config(yaml: &str) -> Result<QuantizerConfig> {
    let config: QuantizerConfig = serde_yaml::from_str(yaml)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))?;

    validate_config(&config).map_err(|e| Error::ConfigError(format!("Invalid config: {}", e)))?;

    Ok(config)
}

/// Load a quantizer configuration from a YAML file
///
/// # Example
///
/// ```no_run
/// use cuantizar::{config::load_config, Quantizer};
///
/// let config = load_config("quantize.yaml")?;
/// let quantizer = Quantizer::from_config(&config)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<QuantizerConfig> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    parse_config(&yaml_content)
}

/// Write a quantizer configuration as YAML
pub fn save_config<P: AsRef<Path>>(config: &QuantizerConfig, config_path: P) -> Result<()> {
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;
    fs::write(config_path, yaml)?;
    Ok(())
}
