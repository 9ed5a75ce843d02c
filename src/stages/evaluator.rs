use serde_json::Value;
use std::sync::Arc;

use crate::llm::{ChatMessage, CompletionClient, CompletionRequest};
use crate::models::EvaluationResult;

use super::{extract_json_object, preview, EvalError, StageError};

const EVALUATOR_PROMPT: &str = "You are a strict Math Evaluator.
You will receive a Math Problem and a Proposed Solution.

Task:
1. Verify every step of the calculation.
2. Check the final answer.
3. Return your assessment in JSON format.
4. IMPORTANT: Return ONLY the JSON object. Do not include any explanation outside the JSON.
   {
     \"is_correct\": boolean,
     \"confidence\": integer (0-100),
     \"feedback\": \"string explaining any errors or confirming correctness\"
   }";

pub struct Evaluator {
    client: Arc<dyn CompletionClient>,
    model: String,
}

impl Evaluator {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub async fn evaluate(&self, problem_text: &str, solution: &str) -> Result<EvaluationResult, StageError> {
        let request = CompletionRequest::new(
            self.model.clone(),
            0.0,
            vec![
                ChatMessage::system(EVALUATOR_PROMPT),
                ChatMessage::user(format!(
                    "Problem: {}\n\nProposed Solution:\n{}",
                    problem_text, solution
                )),
            ],
        );
        let output = self.client.complete(&request).await?.into_text()?;
        let result = evaluation_from_output(&output).inspect_err(|e| {
            tracing::warn!(stage = "evaluator", input = %preview(problem_text), error = %e, "evaluator output rejected");
        })?;
        Ok(result)
    }
}

/// Validate model JSON into an [`EvaluationResult`], clamping confidence
/// into `0..=100`.
pub fn evaluation_from_output(output: &str) -> Result<EvaluationResult, EvalError> {
    let map = extract_json_object(output).ok_or_else(|| EvalError::NotJson(preview(output)))?;

    let is_correct = match map.get("is_correct") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        _ => return Err(EvalError::MissingField("is_correct")),
    };

    let raw = map
        .get("confidence")
        .ok_or(EvalError::MissingField("confidence"))?;
    let confidence = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|c| c.is_finite())
    .ok_or_else(|| EvalError::InvalidConfidence(raw.to_string()))?;

    let feedback = map
        .get("feedback")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(EvaluationResult {
        is_correct,
        confidence: confidence.round().clamp(0.0, 100.0) as u8,
        feedback,
    })
}
