//! Enclave version mapping
//!
//! Compute nodes only host enclaves listed in the mapping file, one
//! `name version` pair per line. Blank lines and `#` comments are ignored.

use crate::config::ConfigError;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnclaveMapping {
    versions: BTreeMap<String, String>,
}

impl EnclaveMapping {
    /// Read a mapping file; a missing file is an empty mapping
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("No enclave mapping at {}, no enclave will be hosted", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let mapping = Self::parse(&text);
        info!("Loaded {} enclave mappings from {}", mapping.len(), path.display());
        Ok(mapping)
    }

    pub fn parse(text: &str) -> Self {
        let mut versions = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            if let (Some(name), Some(version)) = (parts.next(), parts.next()) {
                versions.insert(name.to_string(), version.to_string());
            } else {
                warn!("Ignoring mapping line without a version: '{}'", line);
            }
        }
        Self { versions }
    }

    pub fn insert(&mut self, name: &str, version: &str) {
        self.versions.insert(name.to_string(), version.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.versions.contains_key(name)
    }

    pub fn version(&self, name: &str) -> Option<&str> {
        self.versions.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
