//! Mapping file loading.
//!
//! ```yaml
//! ports:
//!   - "8080:dev:my-svc:80"
//!   - "9090:metrics:9090"
//! ```

use std::path::Path;

use podlink_forward::{validate_all, PortMapping};
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct MappingFile {
    #[serde(default)]
    ports: Vec<String>,
}

/// Read and validate every mapping in `path`.
pub fn load_mappings(path: &Path, default_namespace: &str) -> Result<Vec<PortMapping>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read mapping file {}: {e}", path.display())))?;
    parse_mappings(&content, default_namespace)
}

pub fn parse_mappings(content: &str, default_namespace: &str) -> Result<Vec<PortMapping>> {
    let file: MappingFile = serde_yaml::from_str(content)
        .map_err(|e| Error::Config(format!("failed to parse mapping file: {e}")))?;

    if file.ports.is_empty() {
        return Err(Error::Config("mapping file lists no ports".into()));
    }

    let mappings = file
        .ports
        .iter()
        .map(|descriptor| PortMapping::parse(descriptor, default_namespace))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    validate_all(&mappings)?;
    Ok(mappings)
}
