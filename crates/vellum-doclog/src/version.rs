//! Per-document version counters.
//!
//! Each document owns one mutex-guarded cell. `None` means cold: the
//! holder must seed it from `latest_version` before assigning. The cell
//! is only advanced after a successful persist, which is what makes
//! rollback on failure automatic.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use vellum_core::DocumentKey;

/// The guarded counter state: `None` until lazily initialized.
pub(crate) type VersionCell = Option<u64>;

/// Registry of per-document counters.
#[derive(Debug, Default)]
pub(crate) struct VersionCounters {
    cells: DashMap<DocumentKey, Arc<Mutex<VersionCell>>>,
}

impl VersionCounters {
    pub(crate) fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    /// The counter cell for `doc`, created cold on first observation.
    pub(crate) fn cell(&self, doc: &DocumentKey) -> Arc<Mutex<VersionCell>> {
        self.cells
            .entry(doc.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Drop the counter for `doc` (document teardown).
    pub(crate) fn forget(&self, doc: &DocumentKey) {
        self.cells.remove(doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentKey {
        DocumentKey::new("p", "d").unwrap()
    }

    #[tokio::test]
    async fn cell_is_shared_per_document() {
        let counters = VersionCounters::new();
        let a = counters.cell(&doc());
        let b = counters.cell(&doc());

        *a.lock().await = Some(7);
        assert_eq!(*b.lock().await, Some(7));
    }

    #[tokio::test]
    async fn forget_resets_to_cold() {
        let counters = VersionCounters::new();
        *counters.cell(&doc()).lock().await = Some(7);

        counters.forget(&doc());
        assert_eq!(*counters.cell(&doc()).lock().await, None);
    }
}
