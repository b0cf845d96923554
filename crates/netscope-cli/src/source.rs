//! Observation sources backed by JSON files.
//!
//! Both files hold a JSON array: `ObservedNode`s for the crawler output and
//! `ObservedOrganization`s for the home-domain declarations.

use netscope_core::{
    ObservationError, ObservedNode, ObservedNodeSource, ObservedOrganization,
    ObservedOrganizationSource,
};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

pub struct JsonFileSource {
    nodes: PathBuf,
    organizations: Option<PathBuf>,
}

impl JsonFileSource {
    pub fn new(nodes: PathBuf, organizations: Option<PathBuf>) -> Self {
        Self {
            nodes,
            organizations,
        }
    }
}

fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ObservationError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ObservationError(format!("reading {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| ObservationError(format!("parsing {}: {}", path.display(), e)))
}

impl ObservedNodeSource for JsonFileSource {
    fn observe_nodes(&self) -> Result<Vec<ObservedNode>, ObservationError> {
        read_array(&self.nodes)
    }
}

impl ObservedOrganizationSource for JsonFileSource {
    fn observe_organizations(&self) -> Result<Vec<ObservedOrganization>, ObservationError> {
        match &self.organizations {
            Some(path) => read_array(path),
            None => Ok(Vec::new()),
        }
    }
}
