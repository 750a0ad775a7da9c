use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pipeline stage. Registry order is fixed: each stage reads the
/// output of the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Filter,
    Categorize,
    Summarize,
    Extract,
    Format,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Filter,
        Stage::Categorize,
        Stage::Summarize,
        Stage::Extract,
        Stage::Format,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Filter => "filter",
            Stage::Categorize => "categorize",
            Stage::Summarize => "summarize",
            Stage::Extract => "extract",
            Stage::Format => "format",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filter" => Ok(Stage::Filter),
            "categorize" => Ok(Stage::Categorize),
            "summarize" => Ok(Stage::Summarize),
            "extract" => Ok(Stage::Extract),
            "format" => Ok(Stage::Format),
            other => anyhow::bail!("unknown stage '{other}'"),
        }
    }
}

/// What kind of entity a memoization row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Message,
    Channel,
    DailySummary,
    WeeklySummary,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Message => "message",
            EntityKind::Channel => "channel",
            EntityKind::DailySummary => "daily_summary",
            EntityKind::WeeklySummary => "weekly_summary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Full,
    Incremental,
    Channel,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
            SyncType::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildRecord {
    pub id: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub member_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelRecord {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub kind: i64,
    pub parent_id: Option<String>,
    pub position: Option<i64>,
    pub topic: Option<String>,
    pub last_scraped_message_id: Option<String>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub global_name: Option<String>,
    pub discriminator: String,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
}

/// A message row joined with enough author detail for prompting and
/// export.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_username: String,
    pub author_global_name: Option<String>,
    pub author_is_bot: bool,
    pub content: String,
    pub clean_content: String,
    pub timestamp: String,
    pub edited_timestamp: Option<String>,
    pub message_type: i64,
    pub reference_id: Option<String>,
    pub thread_id: Option<String>,
    pub has_embeds: bool,
    pub has_attachments: bool,
    pub reaction_count: i64,
}

/// A message joined to its memoized stage payload.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message: MessageRecord,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ProcessingRow {
    pub entity_type: String,
    pub entity_id: String,
    pub stage: String,
    pub result: serde_json::Value,
    pub model_used: String,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub summary_date: Option<String>,
    pub processed_at: String,
}

/// Payload for writing one memoization row.
#[derive(Debug, Clone)]
pub struct ProcessingWrite<'a> {
    pub entity_type: EntityKind,
    pub entity_id: &'a str,
    pub stage: Stage,
    pub result: &'a serde_json::Value,
    pub model_used: &'a str,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub guild_id: Option<&'a str>,
    pub channel_id: Option<&'a str>,
    pub summary_date: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct EmbedInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttachmentInput {
    pub id: String,
    pub filename: String,
    pub url: Option<String>,
    pub size: i64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractRecord {
    pub id: i64,
    pub source_type: String,
    pub source_id: String,
    pub extract_type: String,
    pub title: Option<String>,
    pub content: String,
    pub formatted_content: Option<String>,
    pub relevance_score: f64,
    pub sentiment: String,
    pub topics: serde_json::Value,
    pub requires_permission: bool,
    pub permission_granted: bool,
    pub created_at: String,
}

/// Payload for appending one marketing extract.
#[derive(Debug, Clone)]
pub struct ExtractWrite<'a> {
    pub source_type: &'a str,
    pub source_id: &'a str,
    pub extract_type: &'a str,
    pub title: Option<&'a str>,
    pub content: &'a str,
    pub relevance_score: f64,
    pub sentiment: &'a str,
    pub topics: &'a serde_json::Value,
    pub requires_permission: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub guilds: i64,
    pub channels: i64,
    pub users: i64,
    pub messages: i64,
    pub embeds: i64,
    pub attachments: i64,
    pub reactions: i64,
    pub processing_rows: i64,
    pub extracts: i64,
    pub sync_runs: i64,
    pub earliest_message: Option<String>,
    pub latest_message: Option<String>,
    pub file_size_bytes: Option<u64>,
}

/// Filters shared by the stage candidate queries.
#[derive(Debug, Clone, Default)]
pub struct MessageWindow {
    pub channel_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}
