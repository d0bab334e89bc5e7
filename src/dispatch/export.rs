//! Export table and per-export access control.

use rustc_hash::FxHashMap;

use crate::app_config::{AccessType, ExportConfig};

/// One exported tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub id: u16,
    pub name: String,
    pub access: AccessType,
    allowed_clients: Option<Vec<String>>,
}

impl Export {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            id: config.id,
            name: config.name,
            access: config.access,
            allowed_clients: config.allowed_clients,
        }
    }

    /// Both read-only flavors refuse writes before the handler runs.
    pub fn is_read_only(&self) -> bool {
        matches!(self.access, AccessType::ReadOnly | AccessType::MetadataOnlyRo)
    }

    pub fn allows_client(&self, machine: &str) -> bool {
        match &self.allowed_clients {
            None => true,
            Some(allowed) => allowed.iter().any(|m| m == machine),
        }
    }
}

/// Exports indexed by the id carried in object handles.
#[derive(Debug, Default)]
pub struct ExportTable {
    exports: FxHashMap<u16, Export>,
}

impl ExportTable {
    pub fn from_configs(configs: impl IntoIterator<Item = ExportConfig>) -> Self {
        let exports = configs
            .into_iter()
            .map(|config| (config.id, Export::new(config)))
            .collect();
        Self { exports }
    }

    pub fn get(&self, id: u16) -> Option<&Export> {
        self.exports.get(&id)
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}
