//! Parser for the host/backend mapping file.
//!
//! The format is line oriented: `hostname: backend-address`. Lines that are
//! empty or start with `#` are skipped. The first `:` separates the hostname
//! from the backend address and both sides are trimmed of surrounding
//! whitespace. There is no escaping. A line without a `:` fails the whole
//! parse; no partial mapping is ever returned. Duplicate hostnames collapse
//! to the last occurrence.
use std::{collections::HashMap, io, path::Path};

use thiserror::Error;

/// Hostname to backend-address pairs, built once at startup and immutable
/// afterwards. The process restarts to pick up changes.
pub type Mapping = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot read mapping file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid mapping line: {0:?}")]
    InvalidLine(String),
}

/// Read and parse the mapping file at `path`.
pub fn load(path: &Path) -> Result<Mapping, MappingError> {
    let content = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&content)
}

/// Parse mapping file contents.
pub fn parse(content: &str) -> Result<Mapping, MappingError> {
    let mut mapping = Mapping::new();
    for line in content.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((hostname, backend)) = line.split_once(':') else {
            return Err(MappingError::InvalidLine(line.to_string()));
        };
        mapping.insert(hostname.trim().to_string(), backend.trim().to_string());
    }
    Ok(mapping)
}
