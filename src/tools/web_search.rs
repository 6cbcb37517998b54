use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{SideEffect, Tool, ToolContext, ToolResult, ToolType};
use crate::engine::parser::SearchRecord;
use crate::providers::search::SearchProvider;

const MAX_RESULTS: usize = 10;

pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
}

impl WebSearchTool {
    pub fn new(provider: Arc<dyn SearchProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn tool_type(&self) -> ToolType {
        ToolType::WebSearch
    }

    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the internet for information. Returns an optional direct answer plus top results with titles and snippets."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Number of results to return (default: 5, max: 10)",
                    "default": 5
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> Result<ToolResult> {
        let query = params["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| anyhow!("Missing query"))?;
        let num_results = (params["num_results"].as_u64().unwrap_or(5) as usize).clamp(1, MAX_RESULTS);

        if !context.search_allowance.try_acquire() {
            return Ok(ToolResult {
                success: false,
                output: json!({
                    "error": "Search budget exhausted for this iteration or mission. Continue with what you have."
                }),
                side_effects: vec![],
            });
        }

        let response = self.provider.search(query, num_results).await?;

        Ok(ToolResult {
            success: true,
            output: json!({
                "answer": response.answer,
                "results": response.results.iter().map(|r| json!({
                    "url": r.url,
                    "title": r.title,
                    "snippet": r.snippet,
                })).collect::<Vec<_>>()
            }),
            side_effects: vec![SideEffect::SearchPerformed(SearchRecord {
                query: query.to_string(),
                result_count: response.results.len(),
                answer: response.answer,
            })],
        })
    }
}
