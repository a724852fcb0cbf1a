//! CLI configuration: an optional JSON file plus command-line overrides.

use std::path::Path;

use anyhow::Context;
use chunkflow_uploader::UploadConfig;

/// Values given on the command line; `None` keeps the file/default value.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub chunk_size: Option<u64>,
    pub concurrency: Option<usize>,
    pub retries: Option<u32>,
}

/// Loads `path` (camelCase JSON, every field optional) or the defaults, then
/// applies `overrides` and validates the result.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<UploadConfig> {
    let mut config = match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<UploadConfig>(&data)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => UploadConfig::default(),
    };

    if let Some(chunk_size) = overrides.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(concurrency) = overrides.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(retries) = overrides.retries {
        config.retry.max_retries = retries;
    }
    config.validate()?;
    Ok(config)
}
