pub mod llm;
pub mod search;

pub use llm::{Completion, CompletionRequest, LLMProvider, MockLLMProvider, TokenUsage};
pub use search::{MockSearchProvider, SearchProvider, SearchResponse, SearchResult};
