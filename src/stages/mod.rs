//! Model-backed pipeline stages.
//!
//! Each stage wraps one completion call behind a fixed prompt and a typed
//! output contract. Raw model text never leaves this module: it is either
//! validated into a [`StructuredProblem`](crate::models::StructuredProblem)
//! / [`EvaluationResult`](crate::models::EvaluationResult), or mapped to a
//! [`ParseError`] / [`EvalError`].
//!
//! | Stage | Output | On failure |
//! |-------|--------|------------|
//! | [`Guardrail`] | [`Classification`] | `SafeMath` (fail open) |
//! | [`Parser`] | `StructuredProblem` | turn ends in error |
//! | [`Solver`] | explanation text | turn ends in error |
//! | [`Evaluator`] | `EvaluationResult` | caller degrades |

mod evaluator;
mod guardrail;
mod parser;
mod solver;

pub use evaluator::Evaluator;
pub use guardrail::{Classification, Guardrail};
pub use parser::Parser;
pub use solver::{strip_math_markup, Solver};

use serde_json::Value;
use thiserror::Error;

use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("could not parse problem: {0}")]
    Parse(#[from] ParseError),

    #[error("could not read evaluation: {0}")]
    Eval(#[from] EvalError),

    #[error("solver gave no answer after {0} tool rounds")]
    ToolLoop(usize),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("model output is not a JSON object: {0}")]
    NotJson(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("problem text is empty")]
    EmptyProblem,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("model output is not a JSON object: {0}")]
    NotJson(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("confidence is not a number: {0}")]
    InvalidConfidence(String),
}

/// Pull a JSON object out of model output.
///
/// Accepts bare JSON, JSON inside a ```` ``` ```` fence, or JSON surrounded
/// by prose. Returns `None` if no object can be parsed.
pub(crate) fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = strip_code_fence(text.trim());
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening fence line.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Shorten user input for log lines.
pub(crate) fn preview(text: &str) -> String {
    const MAX: usize = 80;
    let mut out: String = text.chars().take(MAX).collect();
    if text.chars().count() > MAX {
        out.push('…');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_json() {
        let map = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(map["a"], 1);
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "```json\n{\"is_correct\": true}\n```";
        assert_eq!(extract_json_object(text).unwrap()["is_correct"], true);
    }

    #[test]
    fn test_extract_json_with_prose() {
        let text = "Here is the result:\n{\"confidence\": 90}\nHope this helps.";
        assert_eq!(extract_json_object(text).unwrap()["confidence"], 90);
    }

    #[test]
    fn test_extract_rejects_non_objects() {
        assert!(extract_json_object("[1, 2]").is_none());
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} {").is_none());
    }

    #[test]
    fn test_preview_truncates_on_chars() {
        let long = "é".repeat(100);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 81);
        assert_eq!(preview("short"), "short");
    }
}
