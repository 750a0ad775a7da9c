//! Scrape-pass orchestration: channel enumeration, incremental resume
//! cursors, persistence ordering, and the sync-state ledger.

pub mod pager;

use std::sync::atomic::{AtomicBool, Ordering};

use futures::TryStreamExt;
use tracing::{info, warn};

use crate::db::{Database, GuildRecord, MessageRecord, SyncType, UserRecord};
use crate::discord::{format_timestamp, ChatGateway, ChannelProfile, MessageBundle};

pub use pager::{stream_messages, FetchOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeMode {
    /// Walk each channel's full history, newest to oldest.
    Full,
    /// Resume each channel from its stored high-watermark.
    Incremental,
}

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub mode: ScrapeMode,
    /// When non-empty, only channels with these names are scraped.
    pub channel_names: Vec<String>,
    /// Per-channel message cap.
    pub limit: Option<usize>,
    pub delay_ms: u64,
    pub dry_run: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            mode: ScrapeMode::Incremental,
            channel_names: Vec::new(),
            limit: None,
            delay_ms: 100,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    pub sync_id: Option<i64>,
    pub channels_scraped: usize,
    pub channels_failed: usize,
    pub messages_saved: i64,
}

enum ChannelFailure {
    /// Upstream fetch problem; skip the channel, keep the pass going.
    Fetch(anyhow::Error),
    /// Store writes must not fail silently; abort the pass.
    Store(anyhow::Error),
    Cancelled,
}

/// Drive one scrape pass over a guild. Per-channel fetch errors are
/// logged and skipped; the resume cursor only advances for channels
/// that complete.
pub async fn run_scrape(
    db: &Database,
    gateway: &dyn ChatGateway,
    guild_id: &str,
    opts: &ScrapeOptions,
    cancel: &AtomicBool,
) -> anyhow::Result<ScrapeOutcome> {
    let guild = gateway.fetch_guild(guild_id).await?;
    info!(guild = %guild.name, bot = %gateway.bot_tag(), "starting scrape pass");

    let mut outcome = ScrapeOutcome::default();
    if !opts.dry_run {
        db.upsert_guild(&GuildRecord {
            id: guild.id.clone(),
            name: guild.name.clone(),
            icon_url: guild.icon_url.clone(),
            member_count: guild.member_count,
        })?;
        let sync_type = if !opts.channel_names.is_empty() {
            SyncType::Channel
        } else if opts.mode == ScrapeMode::Full {
            SyncType::Full
        } else {
            SyncType::Incremental
        };
        outcome.sync_id = Some(db.begin_sync(sync_type, Some(guild_id), None)?);
    }

    let channels: Vec<ChannelProfile> = gateway
        .list_channels(guild_id)
        .await?
        .into_iter()
        .filter(|channel| channel.scrapeable())
        .filter(|channel| {
            opts.channel_names.is_empty() || opts.channel_names.contains(&channel.name)
        })
        .collect();
    info!(channels = channels.len(), "channels selected for scraping");

    for channel in &channels {
        if cancel.load(Ordering::Relaxed) {
            return cancelled(db, &outcome);
        }

        match scrape_channel(db, gateway, channel, opts, cancel).await {
            Ok(saved) => {
                outcome.channels_scraped += 1;
                outcome.messages_saved += saved;
                info!(channel = %channel.name, saved, "channel scraped");
            }
            Err(ChannelFailure::Fetch(error)) => {
                outcome.channels_failed += 1;
                warn!(channel = %channel.name, %error, "channel scrape failed; skipping");
            }
            Err(ChannelFailure::Cancelled) => {
                return cancelled(db, &outcome);
            }
            Err(ChannelFailure::Store(error)) => {
                if let Some(sync_id) = outcome.sync_id {
                    db.fail_sync(sync_id, outcome.messages_saved, &error.to_string())?;
                }
                return Err(error);
            }
        }
    }

    if let Some(sync_id) = outcome.sync_id {
        db.complete_sync(sync_id, outcome.messages_saved)?;
    }
    info!(
        scraped = outcome.channels_scraped,
        failed = outcome.channels_failed,
        messages = outcome.messages_saved,
        "scrape pass finished"
    );
    Ok(outcome)
}

fn cancelled(db: &Database, outcome: &ScrapeOutcome) -> anyhow::Result<ScrapeOutcome> {
    if let Some(sync_id) = outcome.sync_id {
        db.fail_sync(sync_id, outcome.messages_saved, "cancelled")?;
    }
    anyhow::bail!("cancelled")
}

async fn scrape_channel(
    db: &Database,
    gateway: &dyn ChatGateway,
    channel: &ChannelProfile,
    opts: &ScrapeOptions,
    cancel: &AtomicBool,
) -> Result<i64, ChannelFailure> {
    if !opts.dry_run {
        db.upsert_channel(&crate::db::ChannelRecord {
            id: channel.id.clone(),
            guild_id: channel.guild_id.clone(),
            name: channel.name.clone(),
            kind: channel.kind,
            parent_id: channel.parent_id.clone(),
            position: channel.position,
            topic: channel.topic.clone(),
            last_scraped_message_id: None,
            message_count: 0,
        })
        .map_err(ChannelFailure::Store)?;
    }

    let after = if opts.mode == ScrapeMode::Incremental {
        db.channel_last_scraped(&channel.id)
            .map_err(ChannelFailure::Store)?
    } else {
        None
    };

    let fetch = FetchOptions {
        after,
        before: None,
        limit: opts.limit,
        delay_ms: opts.delay_ms,
    };

    let mut saved = 0i64;
    let mut max_id: Option<String> = None;
    let mut stream = stream_messages(gateway, &channel.id, fetch);
    while let Some(bundle) = stream
        .try_next()
        .await
        .map_err(ChannelFailure::Fetch)?
    {
        if cancel.load(Ordering::Relaxed) {
            return Err(ChannelFailure::Cancelled);
        }
        if !opts.dry_run {
            persist_bundle(db, &bundle).map_err(ChannelFailure::Store)?;
        }
        // Snowflake ids sort lexicographically at equal length; keep
        // the greatest as the resume cursor.
        if max_id.as_deref().map(|cur| bundle.id.as_str() > cur).unwrap_or(true) {
            max_id = Some(bundle.id.clone());
        }
        saved += 1;
    }

    // The watermark advances only after the whole channel succeeded,
    // so a crash mid-channel re-fetches it next run.
    if let (Some(last), false) = (max_id.as_deref(), opts.dry_run) {
        db.update_channel_last_scraped(&channel.id, last)
            .map_err(ChannelFailure::Store)?;
    }
    Ok(saved)
}

/// FK order: author before message before children.
fn persist_bundle(db: &Database, bundle: &MessageBundle) -> anyhow::Result<()> {
    db.upsert_user(&UserRecord {
        id: bundle.author.id.clone(),
        username: bundle.author.username.clone(),
        global_name: bundle.author.global_name.clone(),
        discriminator: bundle.author.discriminator.clone(),
        avatar_url: bundle.author.avatar_url.clone(),
        is_bot: bundle.author.is_bot,
    })?;

    db.upsert_message(&MessageRecord {
        id: bundle.id.clone(),
        channel_id: bundle.channel_id.clone(),
        author_id: bundle.author.id.clone(),
        author_username: bundle.author.username.clone(),
        author_global_name: bundle.author.global_name.clone(),
        author_is_bot: bundle.author.is_bot,
        content: bundle.content.clone(),
        clean_content: bundle.clean_content.clone(),
        timestamp: format_timestamp(&bundle.timestamp),
        edited_timestamp: bundle.edited_at.as_ref().map(format_timestamp),
        message_type: bundle.kind,
        reference_id: bundle.reference_id.clone(),
        thread_id: bundle.thread_id.clone(),
        has_embeds: !bundle.embeds.is_empty(),
        has_attachments: !bundle.attachments.is_empty(),
        reaction_count: bundle.reactions.iter().map(|(_, count)| count).sum(),
    })?;

    db.replace_embeds(&bundle.id, &bundle.embeds)?;
    for attachment in &bundle.attachments {
        db.upsert_attachment(&bundle.id, attachment)?;
    }
    for (emoji, count) in &bundle.reactions {
        db.upsert_reaction(&bundle.id, emoji, *count)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::test_gateway::StubGateway;
    use super::*;
    use crate::db::Database;

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn full_opts() -> ScrapeOptions {
        ScrapeOptions {
            mode: ScrapeMode::Full,
            delay_ms: 0,
            ..ScrapeOptions::default()
        }
    }

    fn incremental_opts() -> ScrapeOptions {
        ScrapeOptions {
            mode: ScrapeMode::Incremental,
            delay_ms: 0,
            ..ScrapeOptions::default()
        }
    }

    #[tokio::test]
    async fn test_full_scrape_sets_watermark() {
        let db = Database::open_in_memory().unwrap();
        let gateway = StubGateway::new();
        gateway.seed_channel("c1", &["100", "200", "300"]);

        let outcome = run_scrape(&db, &gateway, "g1", &full_opts(), &no_cancel())
            .await
            .unwrap();

        assert_eq!(outcome.messages_saved, 3);
        assert_eq!(outcome.channels_scraped, 1);
        assert_eq!(db.channel_last_scraped("c1").unwrap().as_deref(), Some("300"));

        let (status, _, processed) = db.sync_status(outcome.sync_id.unwrap()).unwrap();
        assert_eq!(status, "completed");
        assert_eq!(processed, 3);
    }

    #[tokio::test]
    async fn test_incremental_resume_fetches_only_new() {
        let db = Database::open_in_memory().unwrap();
        let gateway = StubGateway::new();
        gateway.seed_channel("c1", &["100", "200", "300"]);

        run_scrape(&db, &gateway, "g1", &incremental_opts(), &no_cancel())
            .await
            .unwrap();
        assert_eq!(db.channel_last_scraped("c1").unwrap().as_deref(), Some("300"));

        gateway.append_message("c1", "400");
        let outcome = run_scrape(&db, &gateway, "g1", &incremental_opts(), &no_cancel())
            .await
            .unwrap();
        assert_eq!(outcome.messages_saved, 1);
        assert_eq!(db.channel_last_scraped("c1").unwrap().as_deref(), Some("400"));
        assert_eq!(db.stats().unwrap().messages, 4);
    }

    #[tokio::test]
    async fn test_incremental_with_empty_upstream_keeps_cursor() {
        let db = Database::open_in_memory().unwrap();
        let gateway = StubGateway::new();
        gateway.seed_channel("c1", &["100", "200"]);

        run_scrape(&db, &gateway, "g1", &incremental_opts(), &no_cancel())
            .await
            .unwrap();
        let outcome = run_scrape(&db, &gateway, "g1", &incremental_opts(), &no_cancel())
            .await
            .unwrap();

        assert_eq!(outcome.messages_saved, 0);
        assert_eq!(db.channel_last_scraped("c1").unwrap().as_deref(), Some("200"));
        assert_eq!(db.stats().unwrap().messages, 2);
    }

    #[tokio::test]
    async fn test_channel_error_skips_and_completes() {
        let db = Database::open_in_memory().unwrap();
        let gateway = StubGateway::new();
        gateway.seed_channel("bad", &["100"]);
        gateway.seed_channel("good", &["500"]);
        gateway.fail_channel("bad");

        let outcome = run_scrape(&db, &gateway, "g1", &full_opts(), &no_cancel())
            .await
            .unwrap();

        assert_eq!(outcome.channels_failed, 1);
        assert_eq!(outcome.channels_scraped, 1);
        // Failed channel keeps no cursor.
        assert_eq!(db.channel_last_scraped("bad").unwrap(), None);
        assert_eq!(db.channel_last_scraped("good").unwrap().as_deref(), Some("500"));

        let (status, _, _) = db.sync_status(outcome.sync_id.unwrap()).unwrap();
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn test_cancellation_marks_sync_failed() {
        let db = Database::open_in_memory().unwrap();
        let gateway = StubGateway::new();
        gateway.seed_channel("c1", &["100"]);

        let cancel = AtomicBool::new(true);
        let error = run_scrape(&db, &gateway, "g1", &full_opts(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "cancelled");

        let conn_status: (String, Option<String>, i64) = db.sync_status(1).unwrap();
        assert_eq!(conn_status.0, "failed");
        assert_eq!(conn_status.1.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let gateway = StubGateway::new();
        gateway.seed_channel("c1", &["100", "200"]);

        let opts = ScrapeOptions {
            dry_run: true,
            ..full_opts()
        };
        let outcome = run_scrape(&db, &gateway, "g1", &opts, &no_cancel())
            .await
            .unwrap();

        assert_eq!(outcome.messages_saved, 2);
        assert_eq!(outcome.sync_id, None);
        let stats = db.stats().unwrap();
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.sync_runs, 0);
    }

    #[tokio::test]
    async fn test_channel_name_filter() {
        let db = Database::open_in_memory().unwrap();
        let gateway = StubGateway::new();
        gateway.seed_channel("c1", &["100"]);
        gateway.seed_channel("c2", &["200"]);

        let opts = ScrapeOptions {
            channel_names: vec!["name-c2".to_string()],
            ..full_opts()
        };
        let outcome = run_scrape(&db, &gateway, "g1", &opts, &no_cancel())
            .await
            .unwrap();

        assert_eq!(outcome.channels_scraped, 1);
        assert_eq!(db.channel_last_scraped("c2").unwrap().as_deref(), Some("200"));
        assert_eq!(db.channel_last_scraped("c1").unwrap(), None);
    }
}
