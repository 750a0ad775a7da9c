pub mod migrations;
pub mod models;

mod ingest;
mod processing;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use rusqlite::Connection;
use tracing::warn;

pub use models::*;

/// Handle to the embedded store. Cloning shares the underlying
/// connection; all writes serialize through the mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (creating file and parent directory if needed), enable
    /// WAL + foreign keys, and apply pending migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_pending(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_pending(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("database lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Per-table counts plus the message time range and file size.
    pub fn stats(&self) -> anyhow::Result<StoreStats> {
        let conn = self.conn();
        let count = |table: &str| -> anyhow::Result<i64> {
            let n = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
            Ok(n)
        };

        let (earliest, latest) = conn.query_row(
            "SELECT MIN(timestamp), MAX(timestamp) FROM messages",
            [],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
        )?;

        let file_size_bytes = self
            .path
            .as_deref()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.len());

        Ok(StoreStats {
            guilds: count("guilds")?,
            channels: count("channels")?,
            users: count("users")?,
            messages: count("messages")?,
            embeds: count("embeds")?,
            attachments: count("attachments")?,
            reactions: count("reactions")?,
            processing_rows: count("ai_processing")?,
            extracts: count("marketing_extracts")?,
            sync_runs: count("sync_state")?,
            earliest_message: earliest,
            latest_message: latest,
            file_size_bytes,
        })
    }

    /// Remove a channel and, via cascade, its messages and their
    /// children.
    pub fn delete_channel(&self, channel_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM channels WHERE id = ?1", [channel_id])?;
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub fn guild(id: &str) -> GuildRecord {
        GuildRecord {
            id: id.to_string(),
            name: format!("guild-{id}"),
            icon_url: None,
            member_count: Some(42),
        }
    }

    pub fn channel(id: &str, guild_id: &str) -> ChannelRecord {
        ChannelRecord {
            id: id.to_string(),
            guild_id: guild_id.to_string(),
            name: format!("channel-{id}"),
            kind: 0,
            parent_id: None,
            position: Some(0),
            topic: None,
            last_scraped_message_id: None,
            message_count: 0,
        }
    }

    pub fn user(id: &str, username: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            username: username.to_string(),
            global_name: None,
            discriminator: "0".to_string(),
            avatar_url: None,
            is_bot: false,
        }
    }

    pub fn message(id: &str, channel_id: &str, author_id: &str, ts: &str) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            author_id: author_id.to_string(),
            author_username: String::new(),
            author_global_name: None,
            author_is_bot: false,
            content: format!("message {id}"),
            clean_content: format!("message {id}"),
            timestamp: ts.to_string(),
            edited_timestamp: None,
            message_type: 0,
            reference_id: None,
            thread_id: None,
            has_embeds: false,
            has_attachments: false,
            reaction_count: 0,
        }
    }

    /// Store with one guild and one channel ready for messages.
    pub fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_guild(&guild("g1")).unwrap();
        db.upsert_channel(&channel("c1", "g1")).unwrap();
        db.upsert_user(&user("u1", "alice")).unwrap();
        db
    }
}
