use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use crate::engine::parser::SearchRecord;
use crate::providers::{CompletionRequest, LLMProvider, TokenUsage};
use crate::tools::runtime::ToolRuntime;
use crate::tools::{SideEffect, ToolContext, ToolType};
use crate::types::Message;

/// Final reply of a bounded tool-use conversation.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
    pub searches: Vec<SearchRecord>,
    pub steps: usize,
}

/// Runs the work-producing model call, executing tool calls between turns.
pub struct WorkGenerator {
    llm_provider: Arc<dyn LLMProvider>,
    tool_runtime: Arc<ToolRuntime>,
}

impl WorkGenerator {
    pub fn new(llm_provider: Arc<dyn LLMProvider>, tool_runtime: Arc<ToolRuntime>) -> Self {
        Self {
            llm_provider,
            tool_runtime,
        }
    }

    /// Calls the model at most `step_limit` times. Tool calls in a reply are
    /// executed and fed back; the last allowed turn is returned as-is.
    pub async fn generate(
        &self,
        system: &str,
        mut messages: Vec<Message>,
        tools: &[ToolType],
        context: &ToolContext,
        step_limit: usize,
    ) -> Result<Generation> {
        let tools: Vec<ToolType> = tools
            .iter()
            .copied()
            .filter(|t| self.tool_runtime.has_tool(*t))
            .collect();
        let system = if tools.is_empty() {
            system.to_string()
        } else {
            format!("{}\n\n{}", system, self.tool_instructions(&tools))
        };

        let mut generation = Generation::default();
        let step_limit = step_limit.max(1);

        loop {
            generation.steps += 1;
            let completion = self
                .llm_provider
                .complete(CompletionRequest::new(system.clone(), messages.clone()))
                .await?;
            generation.usage.add(completion.usage);

            let calls = ToolRuntime::parse_tool_calls(&completion.text, &tools);
            if calls.is_empty() || generation.steps >= step_limit {
                generation.text = completion.text;
                return Ok(generation);
            }

            let mut tool_outputs = Vec::new();
            for call in calls {
                let output = match self.tool_runtime.execute(&call, context).await {
                    Ok(result) => {
                        for effect in result.side_effects {
                            match effect {
                                SideEffect::SearchPerformed(record) => {
                                    generation.searches.push(record)
                                }
                            }
                        }
                        result.output
                    }
                    Err(e) => {
                        log::warn!(
                            "Tool {} failed for agent {}: {}",
                            call.tool_type.as_str(),
                            context.agent_id,
                            e
                        );
                        json!({ "error": e.to_string() })
                    }
                };
                tool_outputs.push(format!(
                    "Tool {} result: {}",
                    call.tool_type.as_str(),
                    serde_json::to_string(&output)?
                ));
            }

            messages.push(Message::assistant(completion.text));
            messages.push(Message::user(format!(
                "Tool execution results:\n{}",
                tool_outputs.join("\n")
            )));
        }
    }

    fn tool_instructions(&self, tools: &[ToolType]) -> String {
        let schemas = self.tool_runtime.get_schemas(tools);
        format!(
            "Available tools:\n{}\n\nTo call a tool, reply with a line of the form \
             {{\"tool\": \"<name>\", \"params\": {{...}}}}. When you are done, reply with your JSON result.",
            serde_json::to_string_pretty(&schemas).unwrap_or_default()
        )
    }
}
