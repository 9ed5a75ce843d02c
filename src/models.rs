//! Core data models that flow between the pipeline stages.
//!
//! [`StructuredProblem`] and [`EvaluationResult`] are the validated,
//! strongly-typed outputs of the Parser and Evaluator stages. Nothing
//! downstream ever sees raw model JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mathematical area a problem belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topic {
    Algebra,
    Calculus,
    Geometry,
    Probability,
    LinearAlgebra,
    Arithmetic,
    Other,
}

impl Topic {
    /// Map a model-supplied topic label onto the closed set.
    ///
    /// Matching is case-insensitive and ignores spaces, dashes, and
    /// underscores, so `"Linear Algebra"` and `"basic arithmetic"` both land
    /// where expected. Anything unrecognised becomes [`Topic::Other`].
    pub fn from_label(label: &str) -> Self {
        let key: String = label
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "algebra" => Topic::Algebra,
            "calculus" => Topic::Calculus,
            "geometry" | "trigonometry" => Topic::Geometry,
            "probability" | "statistics" | "probabilityandstatistics" => Topic::Probability,
            "linearalgebra" => Topic::LinearAlgebra,
            "arithmetic" | "basicarithmetic" => Topic::Arithmetic,
            _ => Topic::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Algebra => "Algebra",
            Topic::Calculus => "Calculus",
            Topic::Geometry => "Geometry",
            Topic::Probability => "Probability",
            Topic::LinearAlgebra => "LinearAlgebra",
            Topic::Arithmetic => "Arithmetic",
            Topic::Other => "Other",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized math question, produced once per query by the Parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredProblem {
    pub problem_text: String,
    pub topic: Topic,
    pub variables: Vec<String>,
    pub constraints: Vec<String>,
    pub needs_clarification: bool,
}

/// A user-verified problem/solution pair persisted in the memory file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub problem: String,
    pub solution: String,
    pub topic: String,
}

/// Evaluator verdict on a proposed solution. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub is_correct: bool,
    /// Always within `0..=100`.
    pub confidence: u8,
    pub feedback: String,
}

/// Where the text of a query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Image,
    Audio,
}

/// Kind of media awaiting human confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

impl From<MediaKind> for InputKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => InputKind::Image,
            MediaKind::Audio => InputKind::Audio,
        }
    }
}

/// Extracted text waiting for a human to confirm (or correct) it.
#[derive(Debug, Clone, Serialize)]
pub struct PendingHitlEntry {
    pub kind: MediaKind,
    #[serde(skip)]
    pub raw_media: Vec<u8>,
    pub extracted_text: String,
    /// Set once the text has been edited by a human.
    pub edited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in the conversation, with optional pipeline metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Parsed problem behind an assistant solution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredProblem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    /// True when accurate/inaccurate feedback may be given on this turn.
    pub feedback_eligible: bool,
    /// True when the solution came from memory rather than the solver.
    pub recalled: bool,
    /// Set by an "inaccurate" feedback action.
    pub flagged: bool,
    /// Uploaded image behind this turn. Serialised as a `has_source_image`
    /// flag; the bytes are served by `GET /sessions/{id}/turns/{n}/image`.
    #[serde(rename = "has_source_image", serialize_with = "serialize_presence")]
    pub source_image: Option<Vec<u8>>,
}

fn serialize_presence<S: serde::Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bool(value.is_some())
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            created_at: Utc::now(),
            structured: None,
            confidence: None,
            feedback_eligible: false,
            recalled: false,
            flagged: false,
            source_image: None,
        }
    }

    pub fn has_source_image(&self) -> bool {
        self.source_image.is_some()
    }
}

/// A chunk of a knowledge-base document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub document: String,
    pub chunk_index: usize,
    pub text: String,
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_labels() {
        assert_eq!(Topic::from_label("Linear Algebra"), Topic::LinearAlgebra);
        assert_eq!(Topic::from_label("Basic Arithmetic"), Topic::Arithmetic);
        assert_eq!(Topic::from_label("calculus"), Topic::Calculus);
        assert_eq!(Topic::from_label("Number Theory"), Topic::Other);
        assert_eq!(Topic::from_label(""), Topic::Other);
    }

    #[test]
    fn test_topic_display_roundtrips_through_label() {
        for t in [
            Topic::Algebra,
            Topic::Calculus,
            Topic::Geometry,
            Topic::Probability,
            Topic::LinearAlgebra,
            Topic::Arithmetic,
        ] {
            assert_eq!(Topic::from_label(&t.to_string()), t);
        }
    }

    #[test]
    fn test_turn_reports_source_image_without_bytes() {
        let mut turn = ConversationTurn::user("Analyze this image.");
        assert_eq!(serde_json::to_value(&turn).unwrap()["has_source_image"], false);

        turn.source_image = Some(vec![0x89, b'P', b'N', b'G']);
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["has_source_image"], true);
        assert!(json.get("source_image").is_none());
    }
}
