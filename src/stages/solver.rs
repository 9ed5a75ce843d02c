use std::sync::Arc;

use crate::llm::{ChatMessage, CompletionClient, CompletionRequest};
use crate::models::StructuredProblem;
use crate::tools::ToolRegistry;

use super::{preview, StageError};

fn solver_prompt(problem: &StructuredProblem, context: &str) -> String {
    format!(
        "You are an expert JEE Math Tutor.
Your goal is to help a student understand the concepts deeply, not just get the answer.

Context (Formulas/Rules):
{context}

Problem Details:
Topic: {topic}
Variables: {variables}

Instructions:
1. Structure your response exactly as follows:
   - ### Understanding the Problem: A brief conceptual intro.
   - ### Step 1: Identify Key Information: List given values and what we need to find.
   - ### Step 2: Apply the Concept/Formula: State the formula/rule explicitly and substitute values.
   - ### Step 3: Solve Calculation: Show the math clearly.
   - ### Why This Works: A short explanation of the logic.
   - ### Conclusion: A final summary sentence.
   - ### Final Answer: The clear result in bold (e.g., **x = 5**).
2. Be didactic: write it like a textbook explanation.
3. Use the calculate tool for any arithmetic you are not certain of.
4. Formatting: PLAIN TEXT ONLY.
   - DO NOT use LaTeX.
   - DO NOT use $ dollar signs.
   - Write fractions as 3/8 or 1/2.
   - Write squares as x^2.
   - Write multiplication as * or x.",
        context = if context.trim().is_empty() { "(none)" } else { context },
        topic = problem.topic,
        variables = if problem.variables.is_empty() {
            "(none)".to_string()
        } else {
            problem.variables.join(", ")
        },
    )
}

/// Tool-augmented step-by-step solver.
pub struct Solver {
    client: Arc<dyn CompletionClient>,
    tools: Arc<ToolRegistry>,
    model: String,
    max_iterations: usize,
}

impl Solver {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        tools: Arc<ToolRegistry>,
        model: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        Self {
            client,
            tools,
            model: model.into(),
            max_iterations: max_iterations.max(1),
        }
    }

    /// Solve `problem`, letting the model call tools between rounds. Each
    /// round is one completion; tool results are fed back as `tool`
    /// messages. The first round that returns text ends the loop.
    pub async fn solve(&self, problem: &StructuredProblem, context: &str) -> Result<String, StageError> {
        let mut messages = vec![
            ChatMessage::system(solver_prompt(problem, context)),
            ChatMessage::user(problem.problem_text.clone()),
        ];
        let definitions = self.tools.definitions();

        for round in 0..self.max_iterations {
            let mut request = CompletionRequest::new(self.model.clone(), 0.1, messages.clone());
            request.tools = definitions.clone();

            let completion = self.client.complete(&request).await.inspect_err(|e| {
                tracing::warn!(stage = "solver", input = %preview(&problem.problem_text), round, error = %e, "solver call failed");
            })?;

            if completion.tool_calls.is_empty() {
                let text = completion.into_text()?;
                return Ok(strip_math_markup(&text));
            }

            let calls = completion.tool_calls;
            messages.push(ChatMessage::assistant(
                completion.content.unwrap_or_default(),
                calls.clone(),
            ));
            for call in &calls {
                let result = self.tools.call(&call.name, &call.arguments).await;
                tracing::debug!(stage = "solver", tool = %call.name, args = %call.arguments, result = %result);
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
        }

        tracing::warn!(stage = "solver", input = %preview(&problem.problem_text), "tool loop exhausted");
        Err(StageError::ToolLoop(self.max_iterations))
    }
}

/// Remove math-markup delimiters the model emits despite instructions.
///
/// `\(`, `\)`, `\[`, `\]` and `$$` always go. A single `$` is removed only
/// as half of an inline pair: the opener must be followed by a non-space,
/// the closer preceded by a non-space and not followed by a digit. Currency
/// such as "$5 and $10" is left alone.
pub fn strip_math_markup(text: &str) -> String {
    let text = text
        .replace("\\(", "")
        .replace("\\)", "")
        .replace("\\[", "")
        .replace("\\]", "")
        .replace("$$", "");

    let chars: Vec<char> = text.chars().collect();
    let mut drop = vec![false; chars.len()];
    let mut open: Option<usize> = None;
    for (i, &c) in chars.iter().enumerate() {
        if c != '$' {
            continue;
        }
        let before = i.checked_sub(1).map(|j| chars[j]);
        let after = chars.get(i + 1).copied();
        let closes = before.is_some_and(|b| !b.is_whitespace())
            && !after.is_some_and(|a| a.is_ascii_digit());
        let opens = after.is_some_and(|a| !a.is_whitespace());

        match open {
            Some(o) if closes => {
                drop[o] = true;
                drop[i] = true;
                open = None;
            }
            _ if opens => open = Some(i),
            _ => {}
        }
    }

    chars
        .iter()
        .zip(drop)
        .filter(|(_, d)| !d)
        .map(|(c, _)| c)
        .collect::<String>()
        .trim()
        .to_string()
}
