//! TOML configuration parsing and validation.
//!
//! Every section carries defaults, so an empty file (or a missing section)
//! yields a working configuration that talks to Groq's OpenAI-compatible
//! endpoint and keeps its memory under `data/`.
//!
//! ```toml
//! [llm]
//! base_url = "https://api.groq.com/openai/v1"
//! api_key_env = "GROQ_API_KEY"
//!
//! [embedding]
//! provider = "local"
//! model = "all-minilm-l6-v2"
//!
//! [memory]
//! threshold = 0.3
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Completion service settings shared by every stage.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_text_model")]
    pub guardrail_model: String,
    #[serde(default = "default_text_model")]
    pub parser_model: String,
    #[serde(default = "default_text_model")]
    pub solver_model: String,
    #[serde(default = "default_text_model")]
    pub evaluator_model: String,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    /// Per-request timeout. Unset means calls block until the upstream answers.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            guardrail_model: default_text_model(),
            parser_model: default_text_model(),
            solver_model: default_text_model(),
            evaluator_model: default_text_model(),
            vision_model: default_vision_model(),
            transcription_model: default_transcription_model(),
            timeout_secs: None,
        }
    }
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}
fn default_text_model() -> String {
    "llama-3.1-8b-instant".to_string()
}
fn default_vision_model() -> String {
    "meta-llama/llama-4-scout-17b-16e-instruct".to_string()
}
fn default_transcription_model() -> String {
    "whisper-large-v3".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

#[cfg(feature = "local-embeddings")]
fn default_provider() -> String {
    "local".to_string()
}
#[cfg(not(feature = "local-embeddings"))]
fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Semantic cache of user-verified solutions.
#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_entries_path")]
    pub entries_path: PathBuf,
    #[serde(default = "default_memory_index_dir")]
    pub index_dir: PathBuf,
    /// Squared-L2 distance below which a stored problem counts as a match.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            entries_path: default_entries_path(),
            index_dir: default_memory_index_dir(),
            threshold: default_threshold(),
        }
    }
}

fn default_entries_path() -> PathBuf {
    PathBuf::from("data/memory.json")
}
fn default_memory_index_dir() -> PathBuf {
    PathBuf::from("data/memory_index")
}
fn default_threshold() -> f32 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,
    #[serde(default = "default_knowledge_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            corpus_dir: default_corpus_dir(),
            index_dir: default_knowledge_index_dir(),
            include_globs: default_include_globs(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
        }
    }
}

fn default_corpus_dir() -> PathBuf {
    PathBuf::from("data/knowledge_base")
}
fn default_knowledge_index_dir() -> PathBuf {
    PathBuf::from("data/knowledge_index")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Characters of input the guardrail gets to see.
    #[serde(default = "default_guardrail_prefix")]
    pub guardrail_prefix: usize,
    #[serde(default = "default_solver_max_iterations")]
    pub solver_max_iterations: usize,
    #[serde(default = "default_ocr_command")]
    pub ocr_command: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            guardrail_prefix: default_guardrail_prefix(),
            solver_max_iterations: default_solver_max_iterations(),
            ocr_command: default_ocr_command(),
        }
    }
}

fn default_guardrail_prefix() -> usize {
    500
}
fn default_solver_max_iterations() -> usize {
    6
}
fn default_ocr_command() -> String {
    "tesseract".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest accepted request body. Uploads arrive base64-encoded, so
    /// this must be about 4/3 of the largest image or audio file.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Sessions untouched for this long are dropped; 0 keeps them forever.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_session_ttl_secs() -> u64 {
    3600
}

/// Read and validate a config file.
///
/// A missing file is an error here; the CLI falls back to
/// [`Config::default`] itself when no `--config` was given explicitly.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.memory.threshold <= 0.0 || !config.memory.threshold.is_finite() {
        anyhow::bail!("memory.threshold must be a positive number");
    }

    if config.knowledge.chunk_size == 0 {
        anyhow::bail!("knowledge.chunk_size must be > 0");
    }
    if config.knowledge.chunk_overlap >= config.knowledge.chunk_size {
        anyhow::bail!("knowledge.chunk_overlap must be smaller than knowledge.chunk_size");
    }
    if config.knowledge.top_k == 0 {
        anyhow::bail!("knowledge.top_k must be >= 1");
    }

    if config.pipeline.guardrail_prefix == 0 {
        anyhow::bail!("pipeline.guardrail_prefix must be > 0");
    }
    if config.pipeline.solver_max_iterations == 0 {
        anyhow::bail!("pipeline.solver_max_iterations must be >= 1");
    }

    if config.server.max_body_bytes == 0 {
        anyhow::bail!("server.max_body_bytes must be > 0");
    }

    if config.llm.timeout_secs == Some(0) {
        anyhow::bail!("llm.timeout_secs must be > 0 when set");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }

    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    Ok(())
}
