//! The tutoring pipeline.
//!
//! [`Orchestrator`] sequences the stages for one query at a time:
//!
//! ```text
//! raw text ─▶ guardrail ─▶ parser ─▶ memory lookup ─▶ solver ─▶ evaluator ─▶ Done
//!                │           │            │              │
//!             Blocked   Clarification   Done        Error
//!                        Needed      (recalled)
//! ```
//!
//! Image and audio uploads stop after extraction and wait for the human to
//! confirm (or correct) the text; only [`Orchestrator::confirm_pending`]
//! moves them into the stages above.
//!
//! Stage failures are handled per stage: the guardrail fails open, parser
//! and solver failures end the turn with an error message, and an evaluator
//! failure keeps the solution with confidence 100 and
//! `evaluation_skipped = true`.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::Instrument;

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::extract::{AudioExtractor, OcrEngine, TesseractOcr, VisionExtractor};
use crate::knowledge::KnowledgeRetriever;
use crate::llm::{CompletionClient, OpenAiCompatibleClient};
use crate::memory::MemoryStore;
use crate::models::{ConversationTurn, InputKind, MediaKind, PendingHitlEntry, StructuredProblem};
use crate::session::{Session, SessionError};
use crate::stages::{preview, Classification, Evaluator, Guardrail, Parser, Solver};
use crate::tools::ToolRegistry;

pub const BLOCK_MESSAGE: &str = "Request blocked by safety guardrails.";
pub const IMAGE_TURN_TEXT: &str = "Analyze this image.";

/// How a query ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Done {
        /// Index of the assistant turn holding the solution.
        turn: usize,
        recalled: bool,
        confidence: u8,
        evaluation_skipped: bool,
        solution: String,
        problem: StructuredProblem,
    },
    Blocked,
    ClarificationNeeded {
        question: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Accurate,
    Inaccurate,
}

pub struct Orchestrator {
    guardrail: Guardrail,
    parser: Parser,
    solver: Solver,
    evaluator: Evaluator,
    vision: VisionExtractor,
    audio: AudioExtractor,
    memory: Arc<MemoryStore>,
    knowledge: Arc<KnowledgeRetriever>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        client: Arc<dyn CompletionClient>,
        embedder: Arc<dyn Embedder>,
        ocr: Option<Arc<dyn OcrEngine>>,
    ) -> Self {
        let llm = &config.llm;
        let tools = Arc::new(ToolRegistry::with_builtins());
        Self {
            guardrail: Guardrail::new(client.clone(), &llm.guardrail_model, config.pipeline.guardrail_prefix),
            parser: Parser::new(client.clone(), &llm.parser_model),
            solver: Solver::new(
                client.clone(),
                tools,
                &llm.solver_model,
                config.pipeline.solver_max_iterations,
            ),
            evaluator: Evaluator::new(client.clone(), &llm.evaluator_model),
            vision: VisionExtractor::new(client.clone(), &llm.vision_model, ocr),
            audio: AudioExtractor::new(client, &llm.transcription_model),
            memory: Arc::new(MemoryStore::new(&config.memory, embedder.clone())),
            knowledge: Arc::new(KnowledgeRetriever::new(&config.knowledge, embedder)),
        }
    }

    /// Wire the HTTP completion client, the configured embedder and the
    /// tesseract fallback.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client: Arc<dyn CompletionClient> = Arc::new(OpenAiCompatibleClient::new(&config.llm)?);
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let ocr: Arc<dyn OcrEngine> = Arc::new(TesseractOcr::new(&config.pipeline.ocr_command));
        Ok(Self::new(config, client, embedder, Some(ocr)))
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn knowledge(&self) -> &KnowledgeRetriever {
        &self.knowledge
    }

    /// Run a typed query through the full pipeline.
    pub async fn submit_text(&self, session: &mut Session, text: &str) -> Result<TurnOutcome, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyInput);
        }
        session.begin_text()?;
        session.push(ConversationTurn::user(text));
        let outcome = self.process(session, text, InputKind::Text).await;
        session.finish();
        Ok(outcome)
    }

    /// Extract text from an image and hold it for confirmation.
    pub async fn begin_image(&self, session: &mut Session, image: Vec<u8>) -> Result<String, SessionError> {
        session.discard_pending();
        let text = self.vision.extract(&image).await?;
        Ok(Self::hold(session, MediaKind::Image, image, text))
    }

    /// Transcribe audio and hold the transcript for confirmation.
    pub async fn begin_audio(
        &self,
        session: &mut Session,
        audio: Vec<u8>,
        filename: &str,
    ) -> Result<String, SessionError> {
        session.discard_pending();
        let text = self.audio.extract(&audio, filename).await?;
        Ok(Self::hold(session, MediaKind::Audio, audio, text))
    }

    fn hold(session: &mut Session, kind: MediaKind, raw_media: Vec<u8>, text: String) -> String {
        tracing::info!(session = %session.id(), kind = ?kind, text = %preview(&text), "extraction awaiting confirmation");
        session.set_pending(PendingHitlEntry {
            kind,
            raw_media,
            extracted_text: text.clone(),
            edited: false,
        });
        text
    }

    pub fn edit_pending(&self, session: &mut Session, text: &str) -> Result<(), SessionError> {
        session.edit_pending(text)
    }

    pub fn cancel_pending(&self, session: &mut Session) -> Result<(), SessionError> {
        session.cancel_pending().map(|_| ())
    }

    /// Accept the (possibly edited) extracted text and run the pipeline on it.
    pub async fn confirm_pending(&self, session: &mut Session) -> Result<TurnOutcome, SessionError> {
        let entry = session.take_pending()?;
        let text = entry.extracted_text.trim().to_string();

        let turn = match entry.kind {
            MediaKind::Image => {
                let mut turn = ConversationTurn::user(IMAGE_TURN_TEXT);
                turn.source_image = Some(entry.raw_media);
                turn
            }
            MediaKind::Audio => ConversationTurn::user(format!("Transcript: {}", text)),
        };
        session.push(turn);

        let outcome = self.process(session, &text, entry.kind.into()).await;
        session.finish();
        Ok(outcome)
    }

    /// Record a user verdict on an assistant solution. "Accurate" writes the
    /// solution to memory; "inaccurate" only flags the turn.
    pub async fn feedback(&self, session: &mut Session, index: usize, feedback: Feedback) -> Result<(), SessionError> {
        let turn = session.turn_mut(index)?;
        match feedback {
            Feedback::Inaccurate => {
                if turn.structured.is_none() {
                    return Err(SessionError::FeedbackNotEligible(index));
                }
                turn.flagged = true;
                tracing::info!(turn = index, "solution flagged as inaccurate");
                Ok(())
            }
            Feedback::Accurate => {
                let problem = match &turn.structured {
                    Some(p) if turn.feedback_eligible => p,
                    _ => return Err(SessionError::FeedbackNotEligible(index)),
                };
                self.memory
                    .write(&problem.problem_text, &turn.content, problem.topic.as_str())
                    .await
                    .map_err(|e| SessionError::Memory(e.to_string()))?;
                turn.feedback_eligible = false;
                Ok(())
            }
        }
    }

    async fn process(&self, session: &mut Session, raw: &str, kind: InputKind) -> TurnOutcome {
        let span = tracing::info_span!("turn", session = %session.id(), kind = ?kind);
        self.run_stages(session, raw, kind).instrument(span).await
    }

    async fn run_stages(&self, session: &mut Session, raw: &str, kind: InputKind) -> TurnOutcome {
        if self.guardrail.classify(raw).await == Classification::Unsafe {
            tracing::info!(input = %preview(raw), "input blocked");
            session.push(ConversationTurn::assistant(BLOCK_MESSAGE));
            return TurnOutcome::Blocked;
        }

        let problem = match self.parser.parse(raw).await {
            Ok(p) => p,
            Err(e) => return Self::fail(session, format!("Parser encountered an error: {}", e)),
        };

        // Extracted text was already confirmed by a human.
        if problem.needs_clarification && kind == InputKind::Text {
            let question = format!("Ambiguous input. Did you mean: '{}'?", problem.problem_text);
            session.push(ConversationTurn::assistant(question.clone()));
            return TurnOutcome::ClarificationNeeded { question };
        }

        if let Some(hit) = self.memory.lookup(&problem.problem_text).await {
            tracing::info!(distance = hit.distance, "answered from memory");
            let mut turn = ConversationTurn::assistant(hit.solution.clone());
            turn.structured = Some(problem.clone());
            turn.confidence = Some(100);
            turn.recalled = true;
            let index = session.push(turn);
            return TurnOutcome::Done {
                turn: index,
                recalled: true,
                confidence: 100,
                evaluation_skipped: true,
                solution: hit.solution,
                problem,
            };
        }

        let context = match self.knowledge.retrieve(&problem.problem_text).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(stage = "knowledge", error = %e, "context retrieval failed; solving without it");
                String::new()
            }
        };

        let solution = match self.solver.solve(&problem, &context).await {
            Ok(s) => s,
            Err(e) => return Self::fail(session, format!("Solver encountered an error: {}", e)),
        };

        let (confidence, evaluation_skipped) =
            match self.evaluator.evaluate(&problem.problem_text, &solution).await {
                Ok(eval) => (eval.confidence, false),
                Err(e) => {
                    tracing::warn!(stage = "evaluator", input = %preview(&problem.problem_text), error = %e, "evaluation skipped");
                    (100, true)
                }
            };

        let mut turn = ConversationTurn::assistant(solution.clone());
        turn.structured = Some(problem.clone());
        turn.confidence = Some(confidence);
        turn.feedback_eligible = true;
        let index = session.push(turn);

        TurnOutcome::Done {
            turn: index,
            recalled: false,
            confidence,
            evaluation_skipped,
            solution,
            problem,
        }
    }

    fn fail(session: &mut Session, message: String) -> TurnOutcome {
        tracing::error!(%message, "turn failed");
        session.push(ConversationTurn::assistant(message.clone()));
        TurnOutcome::Error { message }
    }
}
