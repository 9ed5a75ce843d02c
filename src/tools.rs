//! Tools the solver model may call during a solve.
//!
//! A [`Tool`] describes itself with an OpenAI function-calling JSON Schema
//! and executes on a JSON object of arguments. Tools are collected in a
//! [`ToolRegistry`], which renders the `tools` array for the completion
//! request and dispatches tool calls by name.
//!
//! Tool failures never abort a solve. [`ToolRegistry::call`] always returns
//! a string; errors come back as text so the model can read them and
//! recover (e.g. fix a malformed expression and try again).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::calculator::{evaluate, format_number};
use crate::llm::ToolDefinition;

/// A callable tool exposed to the solver model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name the model calls (lowercase, underscores).
    fn name(&self) -> &str;

    /// One-line description the model uses to decide when to call it.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Execute with parsed arguments. The returned value is rendered as the
    /// tool message content: strings verbatim, anything else as JSON.
    async fn execute(&self, params: Value) -> Result<Value>;
}

/// Evaluates arithmetic and trigonometric expressions.
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Evaluates a mathematical expression to get a precise numerical answer. \
         Useful for arithmetic, trigonometry, and complex calculations. \
         Input should be an expression string such as \"2 + 2\" or \"sqrt(16)\"."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. \"(3/8) * 2\" or \"sin(pi/6)\""
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let expression = params["expression"].as_str().unwrap_or("");
        let text = match evaluate(expression) {
            Ok(v) => format_number(v),
            Err(e) => format!("Error evaluating expression: {}", e),
        };
        Ok(Value::String(text))
    }
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the built-in calculator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(CalculatorTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Dispatch a model tool call. `arguments` is the raw JSON string the
    /// model produced.
    pub async fn call(&self, name: &str, arguments: &str) -> String {
        let Some(tool) = self.find(name) else {
            return format!("Error: unknown tool '{}'", name);
        };

        let params: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(arguments) {
                Ok(Value::Object(map)) => Value::Object(map),
                // Some models pass the bare expression instead of an object.
                Ok(Value::String(s)) => json!({ "expression": s }),
                Ok(other) => json!({ "expression": other.to_string() }),
                Err(e) => return format!("Error: invalid tool arguments: {}", e),
            }
        };

        match tool.execute(params).await {
            Ok(Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool execution failed");
                format!("Error: {}", e)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
