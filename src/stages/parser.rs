use serde_json::{Map, Value};
use std::sync::Arc;

use crate::llm::{ChatMessage, CompletionClient, CompletionRequest};
use crate::models::{StructuredProblem, Topic};

use super::{extract_json_object, preview, ParseError, StageError};

const PARSER_PROMPT: &str = "You are an expert Math Parser, specialised in extracting structured data from raw math questions.
Clean up the text, identify the topic (Algebra, Calculus, Geometry, Linear Algebra, Probability, or Basic Arithmetic), variables, and constraints.
If the input is gibberish or missing critical info, set needs_clarification to true.

Respond with a single JSON object and nothing else:
{
  \"problem_text\": \"the clear, cleaned text of the math problem\",
  \"topic\": \"one of the topics above\",
  \"variables\": [\"x\", \"y\"],
  \"constraints\": [\"x > 0\"],
  \"needs_clarification\": false
}";

pub struct Parser {
    client: Arc<dyn CompletionClient>,
    model: String,
}

impl Parser {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub async fn parse(&self, raw_input: &str) -> Result<StructuredProblem, StageError> {
        let request = CompletionRequest::new(
            self.model.clone(),
            0.0,
            vec![
                ChatMessage::system(PARSER_PROMPT),
                ChatMessage::user(format!("Raw Input: {}", raw_input)),
            ],
        );
        let output = self.client.complete(&request).await?.into_text()?;
        let problem = problem_from_output(&output).inspect_err(|e| {
            tracing::warn!(stage = "parser", input = %preview(raw_input), error = %e, "parser output rejected");
        })?;
        tracing::debug!(
            stage = "parser",
            topic = %problem.topic,
            needs_clarification = problem.needs_clarification
        );
        Ok(problem)
    }
}

/// Validate model JSON into a [`StructuredProblem`].
///
/// `problem_text` is required. A missing or unreadable
/// `needs_clarification` counts as `true`, so malformed output asks the
/// user rather than reaching the solver.
pub fn problem_from_output(output: &str) -> Result<StructuredProblem, ParseError> {
    let map = extract_json_object(output).ok_or_else(|| ParseError::NotJson(preview(output)))?;

    let problem_text = map
        .get("problem_text")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("problem_text"))?
        .trim()
        .to_string();
    if problem_text.is_empty() {
        return Err(ParseError::EmptyProblem);
    }

    let topic = map
        .get("topic")
        .and_then(Value::as_str)
        .map(Topic::from_label)
        .unwrap_or(Topic::Other);

    let needs_clarification = match map.get("needs_clarification") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        _ => true,
    };

    Ok(StructuredProblem {
        problem_text,
        topic,
        variables: string_list(&map, "variables"),
        constraints: string_list(&map, "constraints"),
        needs_clarification,
    })
}

fn string_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            s.split(',').map(|p| p.trim().to_string()).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_problem() {
        let p = problem_from_output(
            r#"{"problem_text":"What is 2+2?","topic":"Basic Arithmetic","variables":[],"constraints":[],"needs_clarification":false}"#,
        )
        .unwrap();
        assert_eq!(p.problem_text, "What is 2+2?");
        assert_eq!(p.topic, Topic::Arithmetic);
        assert!(!p.needs_clarification);
    }

    #[test]
    fn test_missing_clarification_defaults_true() {
        let p = problem_from_output(r#"{"problem_text":"solve for x","topic":"Algebra","variables":["x"]}"#)
            .unwrap();
        assert!(p.needs_clarification);
        assert_eq!(p.variables, vec!["x"]);
        assert!(p.constraints.is_empty());
    }

    #[test]
    fn test_non_bool_clarification_defaults_true() {
        let p = problem_from_output(r#"{"problem_text":"x","needs_clarification":"maybe"}"#).unwrap();
        assert!(p.needs_clarification);
        assert_eq!(p.topic, Topic::Other);
    }

    #[test]
    fn test_comma_separated_variables() {
        let p = problem_from_output(
            r#"{"problem_text":"x + y = 3","variables":"x, y","needs_clarification":false}"#,
        )
        .unwrap();
        assert_eq!(p.variables, vec!["x", "y"]);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(problem_from_output("sure!"), Err(ParseError::NotJson(_))));
        assert_eq!(
            problem_from_output(r#"{"topic":"Algebra"}"#),
            Err(ParseError::MissingField("problem_text"))
        );
        assert_eq!(
            problem_from_output(r#"{"problem_text":"  "}"#),
            Err(ParseError::EmptyProblem)
        );
    }
}
