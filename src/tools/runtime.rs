use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::{Tool, ToolCall, ToolContext, ToolResult, ToolType};
use crate::providers::search::SearchProvider;

pub struct ToolRuntime {
    tools: HashMap<ToolType, Box<dyn Tool>>,
}

pub struct ToolConfig {
    pub search_provider: Option<Arc<dyn SearchProvider>>,
}

impl ToolRuntime {
    pub fn new(config: ToolConfig) -> Self {
        let mut tools: HashMap<ToolType, Box<dyn Tool>> = HashMap::new();

        if let Some(search_provider) = config.search_provider {
            tools.insert(
                ToolType::WebSearch,
                Box::new(super::web_search::WebSearchTool::new(search_provider)),
            );
        }

        Self { tools }
    }

    pub fn has_tool(&self, tool_type: ToolType) -> bool {
        self.tools.contains_key(&tool_type)
    }

    pub fn get_schemas(&self, allowed: &[ToolType]) -> Vec<Value> {
        allowed
            .iter()
            .filter_map(|t| self.tools.get(t))
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema(),
                })
            })
            .collect()
    }

    pub async fn execute(&self, tool_call: &ToolCall, context: &ToolContext) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(&tool_call.tool_type)
            .ok_or_else(|| anyhow!("Unknown tool: {:?}", tool_call.tool_type))?;

        tool.execute(tool_call.params.clone(), context).await
    }

    /// Finds `{"tool": "...", "params": {...}}` lines in a model reply.
    pub fn parse_tool_calls(response: &str, allowed: &[ToolType]) -> Vec<ToolCall> {
        let mut calls = Vec::new();

        for line in response.lines() {
            let trimmed = line.trim();
            if !(trimmed.starts_with('{') && trimmed.contains("\"tool\"")) {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<Value>(trimmed) else {
                continue;
            };
            let Some(tool_type) = parsed
                .get("tool")
                .and_then(|t| t.as_str())
                .and_then(ToolType::from_str)
            else {
                continue;
            };
            if allowed.contains(&tool_type) {
                calls.push(ToolCall {
                    tool_type,
                    params: parsed.get("params").cloned().unwrap_or(json!({})),
                });
            }
        }

        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::search::MockSearchProvider;

    #[test]
    fn test_tool_runtime_creation() {
        let runtime = ToolRuntime::new(ToolConfig {
            search_provider: None,
        });
        assert!(!runtime.has_tool(ToolType::WebSearch));
        assert!(runtime.get_schemas(&[ToolType::WebSearch]).is_empty());

        let runtime = ToolRuntime::new(ToolConfig {
            search_provider: Some(Arc::new(MockSearchProvider::new())),
        });
        assert!(runtime.has_tool(ToolType::WebSearch));
        let schemas = runtime.get_schemas(&[ToolType::WebSearch]);
        assert_eq!(schemas[0]["name"], "web_search");
    }

    #[test]
    fn test_parse_tool_calls() {
        let reply = "Let me look that up.\n{\"tool\": \"web_search\", \"params\": {\"query\": \"rust\"}}\n{\"tool\": \"delete_everything\", \"params\": {}}";

        let calls = ToolRuntime::parse_tool_calls(reply, &[ToolType::WebSearch]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params["query"], "rust");

        let calls = ToolRuntime::parse_tool_calls(reply, &[]);
        assert!(calls.is_empty());
    }
}
