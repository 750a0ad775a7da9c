//! Serenity-HTTP-backed [`ChatGateway`]. No gateway websocket is
//! needed for scraping; token auth plus the REST surface covers
//! guild, channel, and message reads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::http::{Http, MessagePagination};
use serenity::model::channel::{ChannelType, GuildChannel, Message};
use serenity::model::guild::{Member, PartialGuild};
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use serenity::model::permissions::Permissions;
use serenity::model::user::User;
use tracing::{debug, info};

use crate::db::{AttachmentInput, EmbedInput};

use super::{
    AuthorProfile, ChatGateway, ChannelProfile, GuildProfile, MessageBundle, PageRequest,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DiscordGateway {
    http: Arc<Http>,
    bot_user_id: UserId,
    bot_tag: String,
}

impl DiscordGateway {
    /// Build an authenticated session and prove readiness by fetching
    /// the bot user, failing hard after 30 s.
    pub async fn connect(token: &str) -> anyhow::Result<Self> {
        let http = Arc::new(Http::new(token));
        let user = tokio::time::timeout(CONNECT_TIMEOUT, http.get_current_user())
            .await
            .map_err(|_| anyhow::anyhow!("Discord session not ready after 30s"))?
            .context("Discord token rejected")?;

        let bot_tag = user.name.clone();
        info!(bot = %bot_tag, "connected to Discord");
        Ok(Self {
            http,
            bot_user_id: user.id,
            bot_tag,
        })
    }

    fn parse_guild_id(guild_id: &str) -> anyhow::Result<GuildId> {
        let raw: u64 = guild_id
            .parse()
            .with_context(|| format!("invalid guild id '{guild_id}'"))?;
        Ok(GuildId::new(raw))
    }

    fn channel_profile(
        guild: &PartialGuild,
        member: &Member,
        channel: &GuildChannel,
    ) -> ChannelProfile {
        let text_based = matches!(
            channel.kind,
            ChannelType::Text
                | ChannelType::News
                | ChannelType::PublicThread
                | ChannelType::PrivateThread
                | ChannelType::NewsThread
        );
        let perms = guild.user_permissions_in(channel, member);
        let readable = perms.contains(Permissions::VIEW_CHANNEL)
            && perms.contains(Permissions::READ_MESSAGE_HISTORY);

        ChannelProfile {
            id: channel.id.to_string(),
            guild_id: channel.guild_id.to_string(),
            name: channel.name.clone(),
            kind: u8::from(channel.kind) as i64,
            parent_id: channel.parent_id.map(|id| id.to_string()),
            position: Some(channel.position as i64),
            topic: channel.topic.clone(),
            text_based,
            readable,
        }
    }
}

#[async_trait]
impl ChatGateway for DiscordGateway {
    fn bot_tag(&self) -> String {
        self.bot_tag.clone()
    }

    async fn fetch_guild(&self, guild_id: &str) -> anyhow::Result<GuildProfile> {
        let id = Self::parse_guild_id(guild_id)?;
        let guild = self
            .http
            .get_guild_with_counts(id)
            .await
            .with_context(|| format!("failed to fetch guild {guild_id}"))?;

        Ok(GuildProfile {
            id: guild.id.to_string(),
            name: guild.name.clone(),
            icon_url: guild.icon_url(),
            member_count: guild.approximate_member_count.map(|n| n as i64),
        })
    }

    async fn list_channels(&self, guild_id: &str) -> anyhow::Result<Vec<ChannelProfile>> {
        let id = Self::parse_guild_id(guild_id)?;
        let guild = self.http.get_guild(id).await?;
        let member = self.http.get_member(id, self.bot_user_id).await?;
        let channels = self.http.get_channels(id).await?;

        let profiles: Vec<ChannelProfile> = channels
            .iter()
            .map(|channel| Self::channel_profile(&guild, &member, channel))
            .collect();
        debug!(
            total = profiles.len(),
            scrapeable = profiles.iter().filter(|p| p.scrapeable()).count(),
            "listed guild channels"
        );
        Ok(profiles)
    }

    async fn message_page(
        &self,
        channel_id: &str,
        page: &PageRequest,
    ) -> anyhow::Result<Vec<MessageBundle>> {
        let raw: u64 = channel_id
            .parse()
            .with_context(|| format!("invalid channel id '{channel_id}'"))?;
        let id = ChannelId::new(raw);

        let target = if let Some(after) = &page.after {
            Some(MessagePagination::After(MessageId::new(after.parse()?)))
        } else {
            page.before
                .as_ref()
                .map(|before| before.parse().map(|b| MessagePagination::Before(MessageId::new(b))))
                .transpose()?
        };

        let messages = self
            .http
            .get_messages(id, target, Some(page.limit))
            .await
            .with_context(|| format!("failed to fetch messages for channel {channel_id}"))?;

        Ok(messages.iter().map(|msg| bundle_from(channel_id, msg)).collect())
    }
}

fn bundle_from(channel_id: &str, msg: &Message) -> MessageBundle {
    let author = AuthorProfile {
        id: msg.author.id.to_string(),
        username: msg.author.name.clone(),
        global_name: msg.author.global_name.clone(),
        discriminator: msg
            .author
            .discriminator
            .map(|d| format!("{:04}", d.get()))
            .unwrap_or_else(|| "0".to_string()),
        avatar_url: msg.author.avatar_url(),
        is_bot: msg.author.bot,
    };

    let embeds = msg
        .embeds
        .iter()
        .map(|embed| EmbedInput {
            title: embed.title.clone(),
            description: embed.description.clone(),
            url: embed.url.clone(),
        })
        .collect();

    let attachments = msg
        .attachments
        .iter()
        .map(|attachment| AttachmentInput {
            id: attachment.id.to_string(),
            filename: attachment.filename.clone(),
            url: Some(attachment.url.clone()),
            size: attachment.size as i64,
            content_type: attachment.content_type.clone(),
        })
        .collect();

    let reactions = msg
        .reactions
        .iter()
        .map(|reaction| (reaction.reaction_type.to_string(), reaction.count as i64))
        .collect();

    MessageBundle {
        id: msg.id.to_string(),
        channel_id: channel_id.to_string(),
        author,
        content: msg.content.clone(),
        clean_content: clean_content(&msg.content, &msg.mentions),
        timestamp: to_utc(msg.timestamp.unix_timestamp()),
        edited_at: msg.edited_timestamp.map(|ts| to_utc(ts.unix_timestamp())),
        kind: u8::from(msg.kind) as i64,
        reference_id: msg
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| id.to_string()),
        thread_id: msg.thread.as_ref().map(|thread| thread.id.to_string()),
        embeds,
        attachments,
        reactions,
    }
}

fn to_utc(unix: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(unix, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Rewrite raw `<@id>` mention syntax into readable `@name` form.
fn clean_content(content: &str, mentions: &[User]) -> String {
    let mut cleaned = content.to_string();
    for user in mentions {
        let plain = format!("<@{}>", user.id);
        let nick = format!("<@!{}>", user.id);
        let readable = format!("@{}", user.name);
        cleaned = cleaned.replace(&plain, &readable).replace(&nick, &readable);
    }
    cleaned
}
