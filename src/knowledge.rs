//! Knowledge retriever: topical context snippets for the solver.
//!
//! Walks the corpus directory, chunks every matching file, embeds the
//! chunks into a [`FlatIndex`] persisted under `index_dir`, and answers
//! queries with the `top_k` nearest chunks. The index is built the first
//! time it is needed (or on demand via [`KnowledgeRetriever::build`]) and
//! then cached for the life of the process.
//!
//! A missing or empty corpus is not an error: retrieval just yields an
//! empty context string.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::KnowledgeConfig;
use crate::embedding::{embed_query, Embedder};
use crate::vector_store::FlatIndex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub document: String,
    pub text: String,
}

pub struct KnowledgeRetriever {
    config: KnowledgeConfig,
    embedder: Arc<dyn Embedder>,
    index: OnceCell<FlatIndex<KnowledgeChunk>>,
}

impl KnowledgeRetriever {
    pub fn new(config: &KnowledgeConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config: config.clone(),
            embedder,
            index: OnceCell::new(),
        }
    }

    /// Chunk and embed the corpus, then persist the index. Returns the
    /// number of chunks indexed.
    pub async fn build(&self) -> Result<usize> {
        let index = self.build_index().await?;
        let n = index.len();
        // A concurrent first `retrieve` may have filled the cell already;
        // both indexes come from the same corpus.
        let _ = self.index.set(index);
        Ok(n)
    }

    async fn build_index(&self) -> Result<FlatIndex<KnowledgeChunk>> {
        let chunks = load_corpus(&self.config)?;
        tracing::info!(
            stage = "knowledge",
            chunks = chunks.len(),
            corpus = %self.config.corpus_dir.display(),
            "building knowledge index"
        );
        let items = chunks
            .into_iter()
            .map(|c| (c.text.clone(), c))
            .collect();
        let index = FlatIndex::build(self.embedder.as_ref(), items).await?;
        index.save(&self.config.index_dir)?;
        Ok(index)
    }

    async fn index(&self) -> Result<&FlatIndex<KnowledgeChunk>> {
        self.index
            .get_or_try_init(|| async {
                match FlatIndex::load(&self.config.index_dir) {
                    Ok(Some(index)) if index.model() == self.embedder.model_name() => Ok(index),
                    Ok(Some(index)) => {
                        tracing::warn!(stage = "knowledge", index_model = index.model(), "knowledge index built with another model; rebuilding");
                        self.build_index().await
                    }
                    Ok(None) => self.build_index().await,
                    Err(e) => {
                        tracing::warn!(stage = "knowledge", error = %e, "stored knowledge index unreadable; rebuilding");
                        self.build_index().await
                    }
                }
            })
            .await
    }

    /// Return the nearest corpus chunks for `query`, joined by blank lines.
    pub async fn retrieve(&self, query: &str) -> Result<String> {
        let index = self.index().await?;
        if index.is_empty() {
            return Ok(String::new());
        }
        let q = embed_query(self.embedder.as_ref(), query).await?;
        let snippets: Vec<&str> = index
            .nearest(&q, self.config.top_k)
            .into_iter()
            .map(|n| n.payload.text.as_str())
            .collect();
        Ok(snippets.join("\n\n"))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Read and chunk every corpus document, in path order.
pub fn load_corpus(config: &KnowledgeConfig) -> Result<Vec<KnowledgeChunk>> {
    let root = &config.corpus_dir;
    if !root.exists() {
        return Ok(Vec::new());
    }

    let include = build_globset(&config.include_globs)?;
    let mut paths: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| include.is_match(relative(root, p)))
        .collect();
    paths.sort();

    let mut out = Vec::new();
    for path in paths {
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable corpus file");
                continue;
            }
        };
        let name = relative(root, &path).to_string_lossy().into_owned();
        for chunk in chunk_text(&name, &text, config.chunk_size, config.chunk_overlap) {
            out.push(KnowledgeChunk {
                document: chunk.document,
                text: chunk.text,
            });
        }
    }
    Ok(out)
}

fn relative<'a>(root: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}
