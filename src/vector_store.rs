//! Flat (brute-force) vector index with an on-disk directory format.
//!
//! Used for both the solution memory and the knowledge corpus. Every search
//! scans all vectors and ranks by squared Euclidean distance, which is exact
//! and fast enough for the few thousand entries these stores hold.
//!
//! # On-disk layout
//!
//! ```text
//! <index_dir>/
//!   meta.json      { model, dims, count, checksum }
//!   vectors.bin    count × dims little-endian f32
//!   payloads.json  [P; count]
//! ```
//!
//! [`FlatIndex::save`] writes a complete sibling directory and swaps it into
//! place with renames, so a reader sees either the old index, the new one,
//! or (for an instant) none at all, never a half-written one.

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::embedding::{blob_to_vec, squared_l2, vec_to_blob, Embedder};

#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    model: String,
    dims: usize,
    count: usize,
    checksum: String,
}

/// A search hit borrowed from the index.
#[derive(Debug)]
pub struct Neighbor<'a, P> {
    pub payload: &'a P,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct FlatIndex<P> {
    model: String,
    dims: usize,
    vectors: Vec<Vec<f32>>,
    payloads: Vec<P>,
}

impl<P> FlatIndex<P>
where
    P: Serialize + DeserializeOwned + Clone,
{
    /// Embed every key and build an index over the paired payloads.
    pub async fn build(embedder: &dyn Embedder, items: Vec<(String, P)>) -> Result<Self> {
        let (keys, payloads): (Vec<String>, Vec<P>) = items.into_iter().unzip();
        let vectors = if keys.is_empty() {
            Vec::new()
        } else {
            embedder.embed(&keys).await?
        };

        if vectors.len() != payloads.len() {
            bail!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                payloads.len()
            );
        }

        let dims = vectors.first().map(|v| v.len()).unwrap_or(embedder.dims());
        if vectors.iter().any(|v| v.len() != dims) {
            bail!("embedder returned vectors of inconsistent dimensionality");
        }

        Ok(Self {
            model: embedder.model_name().to_string(),
            dims,
            vectors,
            payloads,
        })
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn payloads(&self) -> &[P] {
        &self.payloads
    }

    /// Return up to `k` payloads ordered by ascending distance.
    /// Ties keep insertion order.
    pub fn nearest(&self, query: &[f32], k: usize) -> Vec<Neighbor<'_, P>> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, squared_l2(query, v)))
            .filter(|(_, d)| d.is_finite())
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(i, distance)| Neighbor {
                payload: &self.payloads[i],
                distance,
            })
            .collect()
    }

    /// Persist the index, atomically replacing whatever is at `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let parent = dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let staging = sibling(dir, "staging");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let mut blob = Vec::with_capacity(self.vectors.len() * self.dims * 4);
        for v in &self.vectors {
            blob.extend_from_slice(&vec_to_blob(v));
        }
        let meta = IndexMeta {
            model: self.model.clone(),
            dims: self.dims,
            count: self.vectors.len(),
            checksum: checksum(&blob),
        };

        std::fs::write(staging.join("vectors.bin"), &blob)?;
        std::fs::write(
            staging.join("payloads.json"),
            serde_json::to_vec(&self.payloads)?,
        )?;
        // meta.json last: its presence marks a complete directory.
        std::fs::write(
            staging.join("meta.json"),
            serde_json::to_vec_pretty(&meta)?,
        )?;

        let retired = sibling(dir, "retired");
        if retired.exists() {
            std::fs::remove_dir_all(&retired)?;
        }
        if dir.exists() {
            std::fs::rename(dir, &retired)
                .with_context(|| format!("Failed to retire old index at {}", dir.display()))?;
        }
        std::fs::rename(&staging, dir)
            .with_context(|| format!("Failed to move new index into {}", dir.display()))?;
        if retired.exists() {
            std::fs::remove_dir_all(&retired)?;
        }
        Ok(())
    }

    /// Load an index from disk. `Ok(None)` when no complete index exists.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let meta_path = dir.join("meta.json");
        if !meta_path.exists() {
            return Ok(None);
        }

        let meta: IndexMeta = serde_json::from_slice(&std::fs::read(&meta_path)?)
            .with_context(|| format!("Corrupt index metadata at {}", meta_path.display()))?;
        let blob = std::fs::read(dir.join("vectors.bin"))?;
        let payloads: Vec<P> = serde_json::from_slice(&std::fs::read(dir.join("payloads.json"))?)
            .with_context(|| format!("Corrupt index payloads in {}", dir.display()))?;

        if checksum(&blob) != meta.checksum {
            bail!("Index checksum mismatch in {}", dir.display());
        }
        if blob.len() != meta.count * meta.dims * 4 || payloads.len() != meta.count {
            bail!("Index shape mismatch in {}", dir.display());
        }

        let vectors = if meta.dims == 0 {
            vec![Vec::new(); meta.count]
        } else {
            blob.chunks_exact(meta.dims * 4).map(blob_to_vec).collect()
        };

        Ok(Some(Self {
            model: meta.model,
            dims: meta.dims,
            vectors,
            payloads,
        }))
    }
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    dir.with_file_name(format!(".{}.{}", name, suffix))
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
