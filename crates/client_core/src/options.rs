use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::domain::PageId;

/// Page-scope configuration the host passes to the page controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeOptions {
    pub page_id: PageId,
    /// Pagelets the server announced for this page.
    pub expected_fragments: usize,
    /// Retired pagelet instances kept for reuse.
    pub reuse_limit: usize,
    pub asset_timeout_ms: u64,
    /// Parent name that stands for the page itself; children of it never wait.
    pub root_parent: String,
    pub loading_class: String,
    /// Query parameter added to natively submitted form actions.
    pub fragment_param: String,
    pub events_capacity: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            page_id: PageId::default(),
            expected_fragments: 0,
            reuse_limit: 20,
            asset_timeout_ms: 25_000,
            root_parent: "bootstrap".into(),
            loading_class: "loading".into(),
            fragment_param: "_pagelet".into(),
            events_capacity: 256,
        }
    }
}

impl PipeOptions {
    pub fn new(page_id: impl Into<PageId>, expected_fragments: usize) -> Self {
        Self {
            page_id: page_id.into(),
            expected_fragments,
            ..Self::default()
        }
    }

    pub fn with_reuse_limit(mut self, reuse_limit: usize) -> Self {
        self.reuse_limit = reuse_limit;
        self
    }

    pub fn asset_timeout(&self) -> Duration {
        Duration::from_millis(self.asset_timeout_ms)
    }

    pub fn is_root(&self, parent: &str) -> bool {
        parent == self.root_parent
    }
}
