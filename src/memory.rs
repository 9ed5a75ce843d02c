//! Semantic cache of user-verified solutions.
//!
//! Entries live in an append-only JSON file; a [`FlatIndex`] over the
//! problem texts sits next to it. A write appends to the file and then
//! rebuilds the whole index from the complete list, so the index always
//! mirrors the file exactly. This costs O(n) embeddings per write, which is
//! fine while writes are gated on a human clicking "accurate"; an
//! incremental insert would be the next step if that ever changes.
//!
//! Writers are serialised through an async mutex inside [`MemoryStore`].
//! Two processes pointing at the same files are not coordinated: the last
//! rebuild wins, and since each rebuild reads the full entry file the index
//! still ends up consistent with whatever the file holds.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::MemoryConfig;
use crate::embedding::{embed_query, Embedder};
use crate::models::MemoryEntry;
use crate::vector_store::FlatIndex;

/// A cached solution close enough to the query to be reused verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    pub problem: String,
    pub solution: String,
    pub topic: String,
    pub distance: f32,
}

pub struct MemoryStore {
    entries_path: PathBuf,
    index_dir: PathBuf,
    threshold: f32,
    embedder: Arc<dyn Embedder>,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(config: &MemoryConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            entries_path: config.entries_path.clone(),
            index_dir: config.index_dir.clone(),
            threshold: config.threshold,
            embedder,
            write_lock: Mutex::new(()),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find a previously verified solution for `problem_text`.
    ///
    /// Returns `None` (never an error) when the index is missing, empty,
    /// unreadable, or when the nearest entry is not strictly below the
    /// distance threshold.
    pub async fn lookup(&self, problem_text: &str) -> Option<MemoryHit> {
        match self.try_lookup(problem_text).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(stage = "memory", error = %e, "memory lookup failed; treating as miss");
                None
            }
        }
    }

    async fn try_lookup(&self, problem_text: &str) -> Result<Option<MemoryHit>> {
        let index: FlatIndex<MemoryEntry> = match FlatIndex::load(&self.index_dir)? {
            Some(index) if !index.is_empty() => index,
            _ => return Ok(None),
        };
        if index.model() != self.embedder.model_name() {
            tracing::warn!(
                stage = "memory",
                index_model = index.model(),
                embedder_model = self.embedder.model_name(),
                "memory index was built with a different model; run `mentor memory rebuild`"
            );
            return Ok(None);
        }

        let query = embed_query(self.embedder.as_ref(), problem_text).await?;
        let hit = index.nearest(&query, 1).into_iter().next();

        Ok(hit.and_then(|n| {
            tracing::debug!(stage = "memory", distance = n.distance, "nearest memory entry");
            (n.distance < self.threshold).then(|| MemoryHit {
                problem: n.payload.problem.clone(),
                solution: n.payload.solution.clone(),
                topic: n.payload.topic.clone(),
                distance: n.distance,
            })
        }))
    }

    /// Persist a verified solution and rebuild the index.
    pub async fn write(&self, problem: &str, solution: &str, topic: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let mut entries = load_entries(&self.entries_path)?;
        entries.push(MemoryEntry {
            problem: problem.to_string(),
            solution: solution.to_string(),
            topic: topic.to_string(),
        });
        write_entries_atomic(&self.entries_path, &entries)?;
        self.rebuild_from(&entries).await?;

        tracing::info!(stage = "memory", entries = entries.len(), "memory entry saved");
        Ok(entries.len())
    }

    /// Rebuild the index from the persisted entry list.
    pub async fn rebuild(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let entries = load_entries(&self.entries_path)?;
        self.rebuild_from(&entries).await?;
        Ok(entries.len())
    }

    async fn rebuild_from(&self, entries: &[MemoryEntry]) -> Result<()> {
        let items = entries
            .iter()
            .map(|e| (e.problem.clone(), e.clone()))
            .collect();
        let index = FlatIndex::build(self.embedder.as_ref(), items)
            .await
            .context("Failed to embed memory entries")?;
        index.save(&self.index_dir)
    }

    pub fn entries(&self) -> Result<Vec<MemoryEntry>> {
        load_entries(&self.entries_path)
    }
}

/// Read the entry list. Missing file is empty; an unparseable file is
/// treated as empty with a warning so one bad write cannot wedge the store.
pub fn load_entries(path: &Path) -> Result<Vec<MemoryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read memory file: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str(&content) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "memory file is not valid JSON; starting empty");
            Ok(Vec::new())
        }
    }
}

/// Write-then-rename so the file is valid JSON after every write.
fn write_entries_atomic(path: &Path, entries: &[MemoryEntry]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> MemoryStore {
        let config = MemoryConfig {
            entries_path: tmp.path().join("data/memory.json"),
            index_dir: tmp.path().join("data/memory_index"),
            threshold: 0.3,
        };
        MemoryStore::new(&config, Arc::new(HashEmbedder::new(256)))
    }

    #[tokio::test]
    async fn test_lookup_without_index_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(store(&tmp).lookup("What is 2+2?").await.is_none());
    }

    #[tokio::test]
    async fn test_write_then_lookup_exact_text() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store
            .write("What is 2+2?", "### Final Answer\n**4**", "Arithmetic")
            .await
            .unwrap();

        let hit = store.lookup("What is 2+2?").await.unwrap();
        assert_eq!(hit.solution, "### Final Answer\n**4**");
        assert_eq!(hit.topic, "Arithmetic");
        assert!(hit.distance < 1e-6);
    }

    #[tokio::test]
    async fn test_unrelated_problem_misses() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.write("What is 2+2?", "4", "Arithmetic").await.unwrap();
        assert!(store
            .lookup("Find the eigenvalues of a 3x3 rotation matrix")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_entries_append_and_index_matches() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.write("p1", "s1", "Algebra").await.unwrap();
        let n = store.write("p2", "s2", "Calculus").await.unwrap();
        assert_eq!(n, 2);

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].problem, "p1");

        let index: FlatIndex<MemoryEntry> =
            FlatIndex::load(&tmp.path().join("data/memory_index")).unwrap().unwrap();
        assert_eq!(index.payloads(), entries.as_slice());
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.write("integrate x dx", "x^2/2 + C", "Calculus").await.unwrap();
        store.write("What is 2+2?", "4", "Arithmetic").await.unwrap();

        store.rebuild().await.unwrap();
        let first = store.lookup("integrate x dx").await;
        store.rebuild().await.unwrap();
        let second = store.lookup("integrate x dx").await;
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    /// Same vectors as the hash embedder, reported under another model name.
    struct RenamedEmbedder(HashEmbedder);

    #[async_trait::async_trait]
    impl Embedder for RenamedEmbedder {
        fn model_name(&self) -> &str {
            "hash-v2"
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.0.embed(texts).await
        }
    }

    #[tokio::test]
    async fn test_index_from_other_model_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        store(&tmp).write("What is 2+2?", "4", "Arithmetic").await.unwrap();

        let config = MemoryConfig {
            entries_path: tmp.path().join("data/memory.json"),
            index_dir: tmp.path().join("data/memory_index"),
            threshold: 0.3,
        };
        let switched = MemoryStore::new(&config, Arc::new(RenamedEmbedder(HashEmbedder::new(256))));
        assert!(switched.lookup("What is 2+2?").await.is_none());

        switched.rebuild().await.unwrap();
        assert!(switched.lookup("What is 2+2?").await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_file_is_treated_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        std::fs::create_dir_all(tmp.path().join("data")).unwrap();
        std::fs::write(tmp.path().join("data/memory.json"), "{not json").unwrap();
        assert!(store.entries().unwrap().is_empty());
        store.write("p", "s", "Other").await.unwrap();
        assert_eq!(store.entries().unwrap().len(), 1);
    }
}
