//! Cache of published definitions.
//!
//! Published definitions never change, so entries are keyed by definition
//! id alone and only expire through capacity or idle time.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::graph::StepGraph;

/// Default cache capacity (number of definitions).
const DEFAULT_CACHE_CAPACITY: u64 = 256;

/// Default time-to-idle for cached definitions (10 minutes).
const DEFAULT_TTI_SECS: u64 = 600;

#[derive(Clone)]
pub struct DefinitionCache {
    cache: Cache<Arc<str>, Arc<StepGraph>>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_idle(Duration::from_secs(DEFAULT_TTI_SECS))
            .build();

        Self { cache }
    }

    pub async fn get(&self, definition_id: &str) -> Option<Arc<StepGraph>> {
        self.cache.get(definition_id).await
    }

    /// Cache a graph. Drafts are ignored since they can still be replaced.
    pub async fn insert(&self, graph: Arc<StepGraph>) {
        if !graph.definition().is_published() {
            return;
        }
        let key: Arc<str> = Arc::from(graph.definition().id.as_str());
        self.cache.insert(key, graph).await;
    }

    pub async fn invalidate(&self, definition_id: &str) {
        self.cache.invalidate(definition_id).await;
    }

    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

impl Default for DefinitionCache {
    fn default() -> Self {
        Self::new()
    }
}
