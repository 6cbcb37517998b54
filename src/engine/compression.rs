use crate::providers::{CompletionRequest, LLMProvider, TokenUsage};
use crate::text::truncate_chars;
use crate::types::Message;

const SUMMARY_MAX_TOKENS: u32 = 600;
const TRANSCRIPT_MAX_CHARS: usize = 12_000;

const SUMMARIZER_PROMPT: &str = "You condense an agent's working notes. Summarize the conversation \
     below in a few short paragraphs: decisions made, facts established, open threads. \
     Plain prose, no JSON.";

#[derive(Debug, Clone)]
pub struct Compressed {
    pub messages: Vec<Message>,
    pub usage: TokenUsage,
    /// False when the summary call failed and the generic note was used.
    pub summarized: bool,
    pub collapsed: usize,
}

/// Compression runs on every `interval`-th iteration once the history has
/// outgrown the trailing window.
pub fn should_compress(iteration: u32, interval: u32, history_len: usize, window: usize) -> bool {
    interval > 0 && iteration > 0 && iteration % interval == 0 && history_len > window
}

/// Collapses everything but the last `window` messages into one summary.
///
/// The summary always names the objective. A failed summary call falls back
/// to a generic continuation note so the iteration still proceeds.
pub async fn compress_history(
    llm: &dyn LLMProvider,
    objective: &str,
    history: &[Message],
    window: usize,
) -> Compressed {
    let split = history.len().saturating_sub(window);
    let (older, recent) = history.split_at(split);

    let transcript = older
        .iter()
        .map(|m| format!("[{}] {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    let request = CompletionRequest::new(
        SUMMARIZER_PROMPT,
        vec![Message::user(format!(
            "Objective: {}\n\nConversation:\n{}",
            objective,
            truncate_chars(&transcript, TRANSCRIPT_MAX_CHARS)
        ))],
    )
    .with_max_tokens(SUMMARY_MAX_TOKENS);

    let (summary, usage, summarized) = match llm.complete(request).await {
        Ok(completion) if !completion.text.trim().is_empty() => {
            (completion.text.trim().to_string(), completion.usage, true)
        }
        Ok(_) => {
            log::warn!("Compression summary came back empty; using continuation note");
            (continuation_note(), TokenUsage::default(), false)
        }
        Err(e) => {
            log::warn!("Compression summary failed: {}; using continuation note", e);
            (continuation_note(), TokenUsage::default(), false)
        }
    };

    let mut messages = Vec::with_capacity(recent.len() + 1);
    messages.push(Message::user(format!(
        "Summary of earlier work on the objective \"{}\":\n{}",
        objective, summary
    )));
    messages.extend_from_slice(recent);

    Compressed {
        messages,
        usage,
        summarized,
        collapsed: older.len(),
    }
}

fn continuation_note() -> String {
    "Earlier messages were condensed. Continue from the most recent state below.".to_string()
}
