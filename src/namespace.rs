//! Dataset namespace lookup.
//!
//! The reconciliation loop only needs one question answered: does the
//! dataset behind a reflection still exist, and if so what is its path and
//! version. Anything richer lives outside this crate.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::DatasetId;

/// Metadata of a dataset as known to the namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub id: DatasetId,
    /// Fully qualified path, e.g. `["source", "sales", "orders"]`.
    pub full_path: Vec<String>,
    pub version: String,
}

impl DatasetConfig {
    pub fn new(id: DatasetId, full_path: Vec<String>, version: impl Into<String>) -> Self {
        Self {
            id,
            full_path,
            version: version.into(),
        }
    }
}

/// Namespace lookup contract consumed by the manager.
pub trait NamespaceService: Send + Sync {
    /// Resolve a dataset by its stable UUID. `None` means the dataset was
    /// deleted.
    fn find_dataset_by_uuid(&self, id: &DatasetId) -> Option<DatasetConfig>;
}

/// In-memory namespace, suitable for embedding and tests.
pub struct MemoryNamespace {
    datasets: RwLock<HashMap<String, DatasetConfig>>,
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
        }
    }

    pub fn put_dataset(&self, dataset: DatasetConfig) {
        self.datasets
            .write()
            .insert(dataset.id.as_str().to_string(), dataset);
    }

    /// Drop a dataset, simulating its deletion upstream.
    pub fn remove_dataset(&self, id: &DatasetId) {
        self.datasets.write().remove(id.as_str());
    }
}

impl NamespaceService for MemoryNamespace {
    fn find_dataset_by_uuid(&self, id: &DatasetId) -> Option<DatasetConfig> {
        self.datasets.read().get(id.as_str()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_removal() {
        let namespace = MemoryNamespace::new();
        let id = DatasetId::new("ds-1");
        namespace.put_dataset(DatasetConfig::new(
            id.clone(),
            vec!["source".into(), "orders".into()],
            "v1",
        ));

        let found = namespace.find_dataset_by_uuid(&id).unwrap();
        assert_eq!(found.full_path, vec!["source", "orders"]);

        namespace.remove_dataset(&id);
        assert!(namespace.find_dataset_by_uuid(&id).is_none());
    }
}
