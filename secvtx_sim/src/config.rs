//! Loading finder configuration from disk.

use std::fs;
use std::path::Path;

use secvtx_core::FinderConfig;
use tracing::info;

use crate::error::SimError;

/// Parse a (possibly partial) JSON finder configuration and validate it.
pub fn load_finder_config(path: impl AsRef<Path>) -> Result<FinderConfig, SimError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let config = parse_finder_config(&text)?;
    info!("Loaded finder configuration from {}", path.display());
    Ok(config)
}

pub fn parse_finder_config(text: &str) -> Result<FinderConfig, SimError> {
    let config: FinderConfig = serde_json::from_str(text)?;
    config.validate()?;
    Ok(config)
}
