//! Shared fixtures for the integration suites.
//!
//! A scripted completion client stands in for the model provider: each
//! stage (recognised by its system prompt) pops replies from its own queue,
//! and every call is recorded so tests can assert which stages ran. The
//! memory and knowledge stores are real, backed by the hash embedder in a
//! temporary directory.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use math_mentor::config::Config;
use math_mentor::embedding::HashEmbedder;
use math_mentor::extract::OcrEngine;
use math_mentor::llm::{Completion, CompletionClient, CompletionRequest, LlmError, TranscriptionRequest};
use math_mentor::pipeline::Orchestrator;

// ─── Scripted client ────────────────────────────────────────────────

#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<HashMap<&'static str, VecDeque<Result<Completion, LlmError>>>>,
    transcripts: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<&'static str>>,
    requests: Mutex<Vec<(&'static str, CompletionRequest)>>,
}

pub fn stage_of(request: &CompletionRequest) -> &'static str {
    let system = request.system_prompt();
    if system.contains("guardrail") {
        "guardrail"
    } else if system.contains("Math Parser") {
        "parser"
    } else if system.contains("Math Evaluator") {
        "evaluator"
    } else if system.contains("You are a Robot") {
        "vision"
    } else {
        "solver"
    }
}

impl ScriptedClient {
    pub fn on(self, stage: &'static str, reply: Result<Completion, LlmError>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn text(self, stage: &'static str, text: &str) -> Self {
        self.on(stage, Ok(Completion::text(text)))
    }

    pub fn fail(self, stage: &'static str, err: LlmError) -> Self {
        self.on(stage, Err(err))
    }

    pub fn transcript(self, reply: Result<String, LlmError>) -> Self {
        self.transcripts.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn requests_for(&self, stage: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let stage = stage_of(request);
        self.calls.lock().unwrap().push(stage);
        self.requests.lock().unwrap().push((stage, request.clone()));
        self.replies
            .lock()
            .unwrap()
            .get_mut(stage)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Err(LlmError::Http(format!("no scripted reply for {}", stage))))
    }

    async fn transcribe(&self, _request: &TranscriptionRequest) -> Result<String, LlmError> {
        self.calls.lock().unwrap().push("transcribe");
        self.transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Http("no scripted transcript".into())))
    }
}

pub struct NoText;

#[async_trait]
impl OcrEngine for NoText {
    async fn recognize(&self, _image: &[u8]) -> anyhow::Result<String> {
        anyhow::bail!("ocr unavailable in tests")
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

/// Config with every store under `tmp`.
pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.memory.entries_path = tmp.path().join("data/memory.json");
    config.memory.index_dir = tmp.path().join("data/memory_index");
    config.knowledge.corpus_dir = tmp.path().join("data/knowledge_base");
    config.knowledge.index_dir = tmp.path().join("data/knowledge_index");
    config
}

pub fn orchestrator(config: &Config, client: Arc<ScriptedClient>) -> Orchestrator {
    let ocr: Arc<dyn OcrEngine> = Arc::new(NoText);
    Orchestrator::new(config, client, Arc::new(HashEmbedder::new(256)), Some(ocr))
}

pub fn setup(client: ScriptedClient) -> (TempDir, Arc<ScriptedClient>, Orchestrator) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let client = Arc::new(client);
    let orchestrator = orchestrator(&config, client.clone());
    (tmp, client, orchestrator)
}

pub fn evaluation(confidence: i64) -> String {
    format!(r#"{{"is_correct": true, "confidence": {}, "feedback": "Correct."}}"#, confidence)
}
