use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::types::{PageId, PageMeta, SelectedPage};

/// Session-wide page metadata discovered by search tools.
///
/// Shared by every query of one orchestrator: pages found by an earlier
/// query resolve for later select calls without another search. Clones share
/// the same map.
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    pages: Arc<Mutex<HashMap<PageId, PageMeta>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PageId, PageMeta>> {
        self.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record metadata for a page. Later writes for the same id overwrite.
    pub fn insert(&self, page_id: impl Into<PageId>, meta: PageMeta) {
        self.lock().insert(page_id.into(), meta);
    }

    /// Record a batch under one lock acquisition.
    pub fn extend<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (PageId, PageMeta)>,
    {
        let mut pages = self.lock();
        let before = pages.len();
        for (id, meta) in entries {
            pages.insert(id, meta);
        }
        let added = pages.len() - before;
        debug!(added, total = pages.len(), "page metadata cached");
        added
    }

    pub fn get(&self, page_id: &str) -> Option<PageMeta> {
        self.lock().get(page_id).cloned()
    }

    /// Resolve ids in the given order. `staged` entries not yet written here
    /// take precedence. Ids with no metadata are returned separately instead
    /// of failing the whole lookup.
    pub fn resolve<'a, I>(
        &self,
        page_ids: I,
        staged: &[(PageId, PageMeta)],
    ) -> (Vec<SelectedPage>, Vec<PageId>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let pages = self.lock();
        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for id in page_ids {
            let staged_meta = staged.iter().rev().find(|(s, _)| s == id).map(|(_, m)| m);
            match staged_meta.or_else(|| pages.get(id)) {
                Some(meta) => resolved.push(SelectedPage::from_meta(id, meta)),
                None => missing.push(id.to_string()),
            }
        }
        (resolved, missing)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
