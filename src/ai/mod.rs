//! LLM plumbing: the completion driver, token estimation and batch
//! packing, prompt templates, output validation, and pre-prompt
//! anonymization.

pub mod anonymize;
pub mod client;
pub mod error;
pub mod prompts;
pub mod schema;
pub mod tokens;

use serde::Serialize;

use crate::db::MessageRecord;

pub use anonymize::{anonymize_messages, Anonymizer};
pub use client::{
    ChatOutcome, ChatRequest, CompletionBackend, JsonOutcome, LlmDriver, OpenAiBackend,
    RetryPolicy, UsageTotals, UsageTracker,
};
pub use error::AiError;
pub use prompts::PromptStore;

/// What a message looks like inside a prompt. Content is the cleaned
/// form; optional engagement signals ride along for the stages that
/// want them.
#[derive(Debug, Clone, Serialize)]
pub struct PromptMessage {
    pub id: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_global_name: Option<String>,
    pub author_id: String,
    pub content: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_embeds: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachments: Option<bool>,
}

impl PromptMessage {
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            id: record.id.clone(),
            author: record.author_username.clone(),
            author_global_name: record.author_global_name.clone(),
            author_id: record.author_id.clone(),
            content: record.clean_content.clone(),
            timestamp: record.timestamp.clone(),
            reaction_count: None,
            has_embeds: None,
            has_attachments: None,
        }
    }

    /// Variant with engagement signals, for categorize and extract.
    pub fn with_signals(record: &MessageRecord) -> Self {
        Self {
            reaction_count: Some(record.reaction_count),
            has_embeds: Some(record.has_embeds),
            has_attachments: Some(record.has_attachments),
            ..Self::from_record(record)
        }
    }
}
