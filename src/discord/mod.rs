//! Chat-service seam. The scraper talks to a [`ChatGateway`] trait
//! carrying plain data bundles, so tests can drive an in-memory
//! gateway and the serenity-backed one stays in `gateway`.

pub mod gateway;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::{AttachmentInput, EmbedInput};

pub use gateway::DiscordGateway;

/// Hard cap Discord places on one message-history request.
pub const PAGE_SIZE: u8 = 100;

#[derive(Debug, Clone)]
pub struct GuildProfile {
    pub id: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub member_count: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ChannelProfile {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub kind: i64,
    pub parent_id: Option<String>,
    pub position: Option<i64>,
    pub topic: Option<String>,
    /// Carries messages the pipeline can use.
    pub text_based: bool,
    /// The bot holds both view and read-message-history here.
    pub readable: bool,
}

impl ChannelProfile {
    pub fn scrapeable(&self) -> bool {
        self.text_based && self.readable
    }
}

#[derive(Debug, Clone)]
pub struct AuthorProfile {
    pub id: String,
    pub username: String,
    pub global_name: Option<String>,
    pub discriminator: String,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
}

/// One scraped message with its author and child entities, ready for
/// persistence.
#[derive(Debug, Clone)]
pub struct MessageBundle {
    pub id: String,
    pub channel_id: String,
    pub author: AuthorProfile,
    pub content: String,
    pub clean_content: String,
    pub timestamp: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub kind: i64,
    pub reference_id: Option<String>,
    pub thread_id: Option<String>,
    pub embeds: Vec<EmbedInput>,
    pub attachments: Vec<AttachmentInput>,
    /// `(emoji, count)` pairs, unique per emoji.
    pub reactions: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: u8,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// The bot identity behind the session, for logging.
    fn bot_tag(&self) -> String;

    async fn fetch_guild(&self, guild_id: &str) -> anyhow::Result<GuildProfile>;

    /// All guild channels, annotated with `text_based`/`readable`;
    /// callers filter on [`ChannelProfile::scrapeable`].
    async fn list_channels(&self, guild_id: &str) -> anyhow::Result<Vec<ChannelProfile>>;

    /// One page of messages, at most [`PAGE_SIZE`], newest first.
    async fn message_page(
        &self,
        channel_id: &str,
        page: &PageRequest,
    ) -> anyhow::Result<Vec<MessageBundle>>;
}

/// RFC-3339 UTC with millisecond precision; lexicographic order on
/// the stored string matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 15, 21, 30, 5).unwrap();
        let a = format_timestamp(&early);
        let b = format_timestamp(&late);
        assert_eq!(a, "2024-06-15T09:00:00.000Z");
        assert!(a < b);
    }
}
