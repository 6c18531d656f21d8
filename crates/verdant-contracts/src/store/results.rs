use serde_json::Value;

use crate::plant::AnalysisResult;

use super::blob::BlobStore;

pub const MAX_STORED_RESULTS: usize = 20;

/// Which persistence level an append reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Full history (after eviction) written.
    Stored { count: usize },
    /// Full write failed; the newest `count` entries were written instead.
    Trimmed { count: usize, reason: String },
    /// Only the new entry could be written.
    NewestOnly { reason: String },
    /// Nothing could be written; memory holds just the new entry.
    Failed { reason: String },
}

impl AppendOutcome {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Stored { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stored { .. } => "stored",
            Self::Trimmed { .. } => "trimmed",
            Self::NewestOnly { .. } => "newest_only",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Stored { .. } => None,
            Self::Trimmed { reason, .. }
            | Self::NewestOnly { reason }
            | Self::Failed { reason } => Some(reason),
        }
    }
}

/// Ordered, size-capped history of analysis results backed by one blob key.
///
/// The in-memory list always mirrors the last successfully persisted list,
/// except after a `Failed` append.
pub struct ResultStore {
    blobs: Box<dyn BlobStore>,
    key: String,
    capacity: usize,
    results: Vec<AnalysisResult>,
}

impl ResultStore {
    /// Loads the persisted snapshot. An unreadable or corrupt blob starts an
    /// empty history instead of failing.
    pub fn load(blobs: Box<dyn BlobStore>, key: impl Into<String>, capacity: usize) -> Self {
        let key = key.into();
        let capacity = capacity.max(1);
        let mut results = blobs
            .read(&key)
            .ok()
            .flatten()
            .map(|raw| parse_results(&raw))
            .unwrap_or_default();
        if results.len() > capacity {
            results.drain(..results.len() - capacity);
        }
        Self {
            blobs,
            key,
            capacity,
            results,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Oldest first.
    pub fn load_all(&self) -> &[AnalysisResult] {
        &self.results
    }

    pub fn for_plant(&self, plant_id: &str) -> Vec<&AnalysisResult> {
        self.results
            .iter()
            .filter(|result| result.belongs_to(plant_id))
            .collect()
    }

    pub fn append(&mut self, result: AnalysisResult) -> AppendOutcome {
        self.results.push(result);
        if self.results.len() > self.capacity {
            let overflow = self.results.len() - self.capacity;
            self.results.drain(..overflow);
        }

        let full_err = match persist_results(self.blobs.as_mut(), &self.key, &self.results) {
            Ok(()) => {
                return AppendOutcome::Stored {
                    count: self.results.len(),
                }
            }
            Err(err) => err,
        };

        let half = (self.capacity / 2).max(1);
        if self.results.len() > half {
            let start = self.results.len() - half;
            let trimmed = &self.results[start..];
            if persist_results(self.blobs.as_mut(), &self.key, trimmed).is_ok() {
                self.results.drain(..start);
                return AppendOutcome::Trimmed {
                    count: self.results.len(),
                    reason: format!("{full_err:#}"),
                };
            }
        }

        let newest_start = self.results.len() - 1;
        let newest_outcome = persist_results(
            self.blobs.as_mut(),
            &self.key,
            &self.results[newest_start..],
        );
        self.results.drain(..newest_start);
        match newest_outcome {
            Ok(()) => AppendOutcome::NewestOnly {
                reason: format!("{full_err:#}"),
            },
            Err(err) => AppendOutcome::Failed {
                reason: format!("{err:#}"),
            },
        }
    }

    /// Removes one result by id; returns whether it existed.
    pub fn remove(&mut self, id: &str) -> anyhow::Result<bool> {
        let Some(index) = self.results.iter().position(|result| result.id == id) else {
            return Ok(false);
        };
        let mut remaining = self.results.clone();
        remaining.remove(index);
        persist_results(self.blobs.as_mut(), &self.key, &remaining)?;
        self.results = remaining;
        Ok(true)
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.blobs.remove(&self.key)?;
        self.results.clear();
        Ok(())
    }
}

fn persist_results(
    blobs: &mut dyn BlobStore,
    key: &str,
    results: &[AnalysisResult],
) -> anyhow::Result<()> {
    let blob = serde_json::to_string(results)?;
    blobs.write(key, &blob)
}

/// Entries that no longer match the schema are skipped individually.
fn parse_results(raw: &str) -> Vec<AnalysisResult> {
    let Ok(Value::Array(rows)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    rows.into_iter()
        .filter_map(|row| serde_json::from_value::<AnalysisResult>(row).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use crate::plant::fixtures::sample_result;
    use crate::plant::AnalysisResult;
    use crate::store::{
        BlobStore, FileBlobStore, MemoryBlobStore, ANALYSIS_RESULTS_KEY, MAX_STORED_RESULTS,
    };

    use super::{AppendOutcome, ResultStore};

    /// Rejects any write holding more than `max_entries` results.
    struct EntryLimitedBlobStore {
        inner: MemoryBlobStore,
        max_entries: usize,
    }

    impl BlobStore for EntryLimitedBlobStore {
        fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.read(key)
        }

        fn write(&mut self, key: &str, blob: &str) -> anyhow::Result<()> {
            let count = serde_json::from_str::<Vec<Value>>(blob)?.len();
            if count > self.max_entries {
                anyhow::bail!("QuotaExceededError: {count} entries do not fit");
            }
            self.inner.write(key, blob)
        }

        fn remove(&mut self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key)
        }
    }

    fn persisted_ids(handle: &MemoryBlobStore) -> Vec<String> {
        let raw = handle.snapshot(ANALYSIS_RESULTS_KEY).unwrap_or_default();
        serde_json::from_str::<Vec<AnalysisResult>>(&raw)
            .unwrap_or_default()
            .into_iter()
            .map(|result| result.id)
            .collect()
    }

    fn ids(results: &[AnalysisResult]) -> Vec<String> {
        results.iter().map(|result| result.id.clone()).collect()
    }

    #[test]
    fn append_beyond_capacity_keeps_most_recent_in_order() {
        let handle = MemoryBlobStore::new();
        let mut store = ResultStore::load(
            Box::new(handle.clone()),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        for idx in 0..25 {
            let outcome = store.append(sample_result(&format!("r-{idx}"), None));
            assert!(!outcome.is_degraded());
        }

        let expected: Vec<String> = (5..25).map(|idx| format!("r-{idx}")).collect();
        assert_eq!(store.len(), MAX_STORED_RESULTS);
        assert_eq!(ids(store.load_all()), expected);
        assert_eq!(persisted_ids(&handle), expected);

        let reloaded = ResultStore::load(
            Box::new(handle.clone()),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        assert_eq!(ids(reloaded.load_all()), expected);
    }

    #[test]
    fn failed_full_write_falls_back_to_half_capacity() {
        let handle = MemoryBlobStore::new();
        let mut store = ResultStore::load(
            Box::new(EntryLimitedBlobStore {
                inner: handle.clone(),
                max_entries: 15,
            }),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        for idx in 0..15 {
            assert_eq!(
                store.append(sample_result(&format!("r-{idx}"), None)),
                AppendOutcome::Stored { count: idx + 1 }
            );
        }

        let outcome = store.append(sample_result("r-15", None));
        assert_eq!(outcome.as_str(), "trimmed");
        assert!(matches!(outcome, AppendOutcome::Trimmed { count: 10, .. }));

        let expected: Vec<String> = (6..16).map(|idx| format!("r-{idx}")).collect();
        assert_eq!(persisted_ids(&handle), expected);
        assert_eq!(ids(store.load_all()), expected);
        assert_eq!(expected.last().map(String::as_str), Some("r-15"));
    }

    #[test]
    fn newest_entry_survives_when_half_capacity_also_fails() {
        let handle = MemoryBlobStore::new();
        let mut store = ResultStore::load(
            Box::new(EntryLimitedBlobStore {
                inner: handle.clone(),
                max_entries: 3,
            }),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        for idx in 0..3 {
            store.append(sample_result(&format!("r-{idx}"), None));
        }
        let outcome = store.append(sample_result("r-3", None));
        assert!(matches!(outcome, AppendOutcome::NewestOnly { .. }));
        assert_eq!(persisted_ids(&handle), vec!["r-3".to_string()]);
        assert_eq!(ids(store.load_all()), vec!["r-3".to_string()]);
    }

    #[test]
    fn total_write_failure_reports_failed_and_keeps_newest_in_memory() {
        let handle = MemoryBlobStore::new().with_quota(4);
        let mut store = ResultStore::load(Box::new(handle.clone()), ANALYSIS_RESULTS_KEY, 4);
        let outcome = store.append(sample_result("r-0", None));
        assert!(matches!(
            outcome,
            AppendOutcome::Failed { ref reason } if reason.contains("storage quota exceeded")
        ));
        assert_eq!(ids(store.load_all()), vec!["r-0".to_string()]);
        assert_eq!(handle.snapshot(ANALYSIS_RESULTS_KEY), None);
    }

    #[test]
    fn corrupt_blob_loads_as_empty_history() {
        let handle = MemoryBlobStore::new();
        handle.insert_raw(ANALYSIS_RESULTS_KEY, "{not json");
        let store = ResultStore::load(Box::new(handle), ANALYSIS_RESULTS_KEY, MAX_STORED_RESULTS);
        assert!(store.is_empty());
    }

    #[test]
    fn schema_drifted_rows_are_skipped() -> anyhow::Result<()> {
        let handle = MemoryBlobStore::new();
        let good = serde_json::to_value(sample_result("ok", None))?;
        handle.insert_raw(
            ANALYSIS_RESULTS_KEY,
            &serde_json::to_string(&vec![serde_json::json!({"id": "broken"}), good])?,
        );
        let store = ResultStore::load(Box::new(handle), ANALYSIS_RESULTS_KEY, MAX_STORED_RESULTS);
        assert_eq!(ids(store.load_all()), vec!["ok".to_string()]);
        Ok(())
    }

    #[test]
    fn oversized_snapshot_is_clipped_on_load() {
        let handle = MemoryBlobStore::new();
        let mut wide = ResultStore::load(Box::new(handle.clone()), ANALYSIS_RESULTS_KEY, 10);
        for idx in 0..10 {
            wide.append(sample_result(&format!("r-{idx}"), None));
        }
        let narrow = ResultStore::load(Box::new(handle), ANALYSIS_RESULTS_KEY, 4);
        assert_eq!(
            ids(narrow.load_all()),
            vec!["r-6", "r-7", "r-8", "r-9"]
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn file_backed_history_survives_restart_and_filters_by_plant() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("store");
        let mut store = ResultStore::load(
            Box::new(FileBlobStore::new(&root)),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        store.append(sample_result("a", Some("fern")));
        store.append(sample_result("b", None));
        store.append(sample_result("c", Some("fern")));

        let mut reloaded = ResultStore::load(
            Box::new(FileBlobStore::new(&root)),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        assert_eq!(ids(reloaded.load_all()), vec!["a", "b", "c"]);
        let fern: Vec<&str> = reloaded
            .for_plant("fern")
            .into_iter()
            .map(|result| result.id.as_str())
            .collect();
        assert_eq!(fern, vec!["a", "c"]);

        assert!(reloaded.remove("b")?);
        assert!(!reloaded.remove("b")?);
        let after_remove = ResultStore::load(
            Box::new(FileBlobStore::new(&root)),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        assert_eq!(ids(after_remove.load_all()), vec!["a", "c"]);

        reloaded.clear()?;
        assert!(reloaded.is_empty());
        let after_clear = ResultStore::load(
            Box::new(FileBlobStore::new(&root)),
            ANALYSIS_RESULTS_KEY,
            MAX_STORED_RESULTS,
        );
        assert!(after_clear.is_empty());
        Ok(())
    }
}
