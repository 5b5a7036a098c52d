//! Adapter lookup by site id or by URL.

use std::collections::HashMap;
use std::sync::Arc;

use promptbridge_core_types::WebsiteInfo;
use tracing::{debug, warn};

use crate::adapter::SiteAdapter;
use crate::sites;

/// Insertion-ordered registry of site adapters.
///
/// Constructed explicitly by whoever owns it so tests can inject a subset;
/// construction has no side effects beyond logging.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SiteAdapter>>,
    by_id: HashMap<String, usize>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Arc<dyn SiteAdapter>>) -> Self {
        let mut ordered = Vec::with_capacity(adapters.len());
        let mut by_id = HashMap::new();
        for adapter in adapters {
            let id = adapter.website_id().to_string();
            if by_id.contains_key(&id) {
                warn!(target: "site-adapters", site = %id, "duplicate adapter id ignored");
                continue;
            }
            by_id.insert(id.clone(), ordered.len());
            debug!(target: "site-adapters", site = %id, "adapter registered");
            ordered.push(adapter);
        }
        Self {
            adapters: ordered,
            by_id,
        }
    }

    /// Registry preloaded with every built-in site adapter.
    pub fn with_defaults() -> Self {
        Self::new(sites::default_adapters())
    }

    pub fn get_by_id(&self, website_id: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.by_id
            .get(website_id)
            .map(|&index| Arc::clone(&self.adapters[index]))
    }

    /// First adapter (in insertion order) whose URL matcher accepts `url`.
    pub fn get_by_url(&self, url: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.matches_url(url))
            .map(Arc::clone)
    }

    pub fn websites(&self) -> Vec<WebsiteInfo> {
        self.adapters.iter().map(|adapter| adapter.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
