//! # Math Mentor
//!
//! A conversational math tutor. Text, image, or audio questions are checked
//! by a safety guardrail, parsed into a structured problem, answered from a
//! memory of human-verified solutions when possible, and otherwise solved
//! step by step by a tool-calling model and scored by an evaluator.
//!
//! ## Architecture
//!
//! ```text
//!  image/audio ─▶ extract ─▶ human confirms ─┐
//!                                            ▼
//!  text ──────────────────────────▶ guardrail ─▶ parser ─▶ memory ─▶ solver ─▶ evaluator
//!                                                            ▲         │
//!                                   "accurate" feedback ─────┘   calculator, knowledge
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export GROQ_API_KEY=...
//! mentor knowledge build            # embed data/knowledge_base
//! mentor ask "What is 2+2?"
//! mentor chat                       # interactive, with /accurate feedback
//! mentor serve                      # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Data passed between stages |
//! | [`llm`] | Completion service trait and OpenAI-compatible client |
//! | [`stages`] | Guardrail, parser, solver, evaluator |
//! | [`calculator`] | Safe expression evaluator |
//! | [`tools`] | Tools exposed to the solver |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Persisted flat nearest-neighbour index |
//! | [`memory`] | Verified-solution cache |
//! | [`chunk`] | Paragraph-aware text chunking |
//! | [`knowledge`] | Knowledge-corpus retriever |
//! | [`extract`] | Image and audio transcription |
//! | [`session`] | Per-user conversation state |
//! | [`pipeline`] | Stage orchestration and human-in-the-loop flow |
//! | [`server`] | HTTP API |

pub mod calculator;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod stages;
pub mod tools;
pub mod vector_store;
