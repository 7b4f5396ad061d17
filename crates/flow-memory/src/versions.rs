use parking_lot::RwLock;
use std::collections::HashSet;

use flow_core::{ContextVersion, Result, VersionStore};

/// Append-only version log held in memory, in insertion order.
#[derive(Default)]
pub struct InMemoryVersionStore {
    versions: RwLock<Vec<ContextVersion>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionStore for InMemoryVersionStore {
    fn append(&self, version: ContextVersion) -> Result<()> {
        self.versions.write().push(version);
        Ok(())
    }

    fn all(&self) -> Vec<ContextVersion> {
        self.versions.read().clone()
    }

    fn for_execution(&self, execution_id: &str) -> Vec<ContextVersion> {
        self.versions
            .read()
            .iter()
            .filter(|v| v.execution_id == execution_id)
            .cloned()
            .collect()
    }

    fn retain_latest(&self, keep: usize) -> usize {
        let mut versions = self.versions.write();
        let total = versions.len();
        if total <= keep {
            return 0;
        }

        // Newest first; on equal timestamps the later append wins.
        let mut order: Vec<usize> = (0..total).collect();
        order.sort_by(|&a, &b| {
            versions[b]
                .timestamp
                .cmp(&versions[a].timestamp)
                .then(b.cmp(&a))
        });
        let kept: HashSet<usize> = order.into_iter().take(keep).collect();

        let mut index = 0;
        versions.retain(|_| {
            let keep_this = kept.contains(&index);
            index += 1;
            keep_this
        });
        total - versions.len()
    }

    fn len(&self) -> usize {
        self.versions.read().len()
    }
}
