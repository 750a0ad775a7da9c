//! Upserts for raw scraped entities and the sync-state ledger.
//!
//! Conflicts update mutable fields only; a message's `timestamp` is
//! never rewritten once inserted.

use rusqlite::params;

use super::models::{
    AttachmentInput, ChannelRecord, EmbedInput, GuildRecord, MessageRecord, SyncType, UserRecord,
};
use super::Database;

impl Database {
    pub fn upsert_guild(&self, guild: &GuildRecord) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO guilds (id, name, icon_url, member_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 icon_url = excluded.icon_url,
                 member_count = excluded.member_count,
                 updated_at = CURRENT_TIMESTAMP",
            params![guild.id, guild.name, guild.icon_url, guild.member_count],
        )?;
        Ok(())
    }

    pub fn upsert_channel(&self, channel: &ChannelRecord) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO channels (id, guild_id, name, kind, parent_id, position, topic)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 kind = excluded.kind,
                 parent_id = excluded.parent_id,
                 position = excluded.position,
                 topic = excluded.topic,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                channel.id,
                channel.guild_id,
                channel.name,
                channel.kind,
                channel.parent_id,
                channel.position,
                channel.topic,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_user(&self, user: &UserRecord) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (id, username, global_name, discriminator, avatar_url, is_bot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 global_name = excluded.global_name,
                 discriminator = excluded.discriminator,
                 avatar_url = excluded.avatar_url,
                 is_bot = excluded.is_bot,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                user.id,
                user.username,
                user.global_name,
                user.discriminator,
                user.avatar_url,
                user.is_bot,
            ],
        )?;
        Ok(())
    }

    /// Insert-or-update a message. Content fields track edits; the
    /// original `timestamp` is preserved on conflict.
    pub fn upsert_message(&self, message: &MessageRecord) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (
                 id, channel_id, author_id, content, clean_content, timestamp,
                 edited_timestamp, message_type, reference_id, thread_id,
                 has_embeds, has_attachments, reaction_count
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 content = excluded.content,
                 clean_content = excluded.clean_content,
                 edited_timestamp = excluded.edited_timestamp,
                 has_embeds = excluded.has_embeds,
                 has_attachments = excluded.has_attachments,
                 reaction_count = excluded.reaction_count",
            params![
                message.id,
                message.channel_id,
                message.author_id,
                message.content,
                message.clean_content,
                message.timestamp,
                message.edited_timestamp,
                message.message_type,
                message.reference_id,
                message.thread_id,
                message.has_embeds,
                message.has_attachments,
                message.reaction_count,
            ],
        )?;
        Ok(())
    }

    /// Embeds have no stable upstream id, so re-encountering a message
    /// replaces its embed rows wholesale.
    pub fn replace_embeds(&self, message_id: &str, embeds: &[EmbedInput]) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM embeds WHERE message_id = ?1", [message_id])?;
        let mut stmt = conn.prepare(
            "INSERT INTO embeds (message_id, title, description, url) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for embed in embeds {
            stmt.execute(params![message_id, embed.title, embed.description, embed.url])?;
        }
        Ok(())
    }

    pub fn upsert_attachment(
        &self,
        message_id: &str,
        attachment: &AttachmentInput,
    ) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO attachments (id, message_id, filename, url, size, content_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 filename = excluded.filename,
                 url = excluded.url,
                 size = excluded.size,
                 content_type = excluded.content_type",
            params![
                attachment.id,
                message_id,
                attachment.filename,
                attachment.url,
                attachment.size,
                attachment.content_type,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_reaction(&self, message_id: &str, emoji: &str, count: i64) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO reactions (message_id, emoji, count)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(message_id, emoji) DO UPDATE SET count = excluded.count",
            params![message_id, emoji, count],
        )?;
        Ok(())
    }

    /// Advance the resume cursor after a channel completes, and
    /// refresh its cached message count.
    pub fn update_channel_last_scraped(
        &self,
        channel_id: &str,
        last_message_id: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE channels SET
                 last_scraped_message_id = ?2,
                 last_scraped_at = CURRENT_TIMESTAMP,
                 message_count = (SELECT COUNT(*) FROM messages WHERE channel_id = ?1),
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![channel_id, last_message_id],
        )?;
        Ok(())
    }

    pub fn channel_last_scraped(&self, channel_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn();
        let cursor = conn
            .query_row(
                "SELECT last_scraped_message_id FROM channels WHERE id = ?1",
                [channel_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .unwrap_or(None);
        Ok(cursor)
    }

    pub fn begin_sync(
        &self,
        sync_type: SyncType,
        guild_id: Option<&str>,
        channel_id: Option<&str>,
    ) -> anyhow::Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_state (sync_type, guild_id, channel_id)
             VALUES (?1, ?2, ?3)",
            params![sync_type.as_str(), guild_id, channel_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn complete_sync(&self, sync_id: i64, messages_processed: i64) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sync_state SET
                 status = 'completed',
                 completed_at = CURRENT_TIMESTAMP,
                 messages_processed = ?2
             WHERE id = ?1 AND status = 'in_progress'",
            params![sync_id, messages_processed],
        )?;
        Ok(())
    }

    pub fn fail_sync(
        &self,
        sync_id: i64,
        messages_processed: i64,
        error: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE sync_state SET
                 status = 'failed',
                 completed_at = CURRENT_TIMESTAMP,
                 messages_processed = ?2,
                 error_message = ?3
             WHERE id = ?1 AND status = 'in_progress'",
            params![sync_id, messages_processed, error],
        )?;
        Ok(())
    }

    pub fn sync_status(&self, sync_id: i64) -> anyhow::Result<(String, Option<String>, i64)> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT status, error_message, messages_processed FROM sync_state WHERE id = ?1",
            [sync_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::*;
    use super::super::Database;
    use super::*;

    #[test]
    fn test_upsert_twice_yields_single_row() {
        let db = seeded();
        let msg = message("m1", "c1", "u1", "2024-06-15T10:00:00.000Z");
        db.upsert_message(&msg).unwrap();
        db.upsert_message(&msg).unwrap();
        assert_eq!(db.stats().unwrap().messages, 1);
    }

    #[test]
    fn test_upsert_updates_mutable_fields_only() {
        let db = seeded();
        let mut msg = message("m1", "c1", "u1", "2024-06-15T10:00:00.000Z");
        db.upsert_message(&msg).unwrap();

        msg.content = "edited".to_string();
        msg.timestamp = "2030-01-01T00:00:00.000Z".to_string();
        msg.edited_timestamp = Some("2024-06-15T11:00:00.000Z".to_string());
        db.upsert_message(&msg).unwrap();

        let conn = db.conn();
        let (content, ts, edited): (String, String, Option<String>) = conn
            .query_row(
                "SELECT content, timestamp, edited_timestamp FROM messages WHERE id = 'm1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(content, "edited");
        // The insert-time timestamp survives the conflicting upsert.
        assert_eq!(ts, "2024-06-15T10:00:00.000Z");
        assert_eq!(edited.as_deref(), Some("2024-06-15T11:00:00.000Z"));
    }

    #[test]
    fn test_user_upsert_updates_profile() {
        let db = seeded();
        let mut u = user("u2", "bob");
        db.upsert_user(&u).unwrap();
        u.username = "bobby".to_string();
        u.global_name = Some("Bobby".to_string());
        db.upsert_user(&u).unwrap();

        let conn = db.conn();
        let (name, global): (String, Option<String>) = conn
            .query_row(
                "SELECT username, global_name FROM users WHERE id = 'u2'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "bobby");
        assert_eq!(global.as_deref(), Some("Bobby"));
    }

    #[test]
    fn test_reaction_unique_per_emoji() {
        let db = seeded();
        db.upsert_message(&message("m1", "c1", "u1", "2024-06-15T10:00:00.000Z"))
            .unwrap();
        db.upsert_reaction("m1", "👍", 1).unwrap();
        db.upsert_reaction("m1", "👍", 5).unwrap();
        db.upsert_reaction("m1", "🎉", 2).unwrap();

        let conn = db.conn();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM reactions WHERE message_id = 'm1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let thumbs: i64 = conn
            .query_row(
                "SELECT count FROM reactions WHERE message_id = 'm1' AND emoji = '👍'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(thumbs, 5);
    }

    #[test]
    fn test_watermark_and_message_count() {
        let db = seeded();
        for id in ["100", "200", "300"] {
            db.upsert_message(&message(id, "c1", "u1", "2024-06-15T10:00:00.000Z"))
                .unwrap();
        }
        db.update_channel_last_scraped("c1", "300").unwrap();

        assert_eq!(db.channel_last_scraped("c1").unwrap().as_deref(), Some("300"));
        let conn = db.conn();
        let count: i64 = conn
            .query_row("SELECT message_count FROM channels WHERE id = 'c1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_sync_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let id = db.begin_sync(SyncType::Incremental, Some("g1"), None).unwrap();

        let (status, _, _) = db.sync_status(id).unwrap();
        assert_eq!(status, "in_progress");

        db.complete_sync(id, 12).unwrap();
        let (status, error, processed) = db.sync_status(id).unwrap();
        assert_eq!(status, "completed");
        assert_eq!(error, None);
        assert_eq!(processed, 12);

        // Terminal once set: a late failure report does not overwrite.
        db.fail_sync(id, 0, "too late").unwrap();
        let (status, _, _) = db.sync_status(id).unwrap();
        assert_eq!(status, "completed");
    }
}
