//! Stage-facing queries: candidate selection, memoization rows, and
//! marketing extracts.

use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, Row};

use super::models::{
    EntityKind, ExtractRecord, ExtractWrite, MessageRecord, MessageWindow, ProcessedMessage,
    ProcessingRow, ProcessingWrite, Stage,
};
use super::Database;

const MESSAGE_COLUMNS: &str = "m.id, m.channel_id, m.author_id, u.username, u.global_name, \
     u.is_bot, m.content, m.clean_content, m.timestamp, m.edited_timestamp, m.message_type, \
     m.reference_id, m.thread_id, m.has_embeds, m.has_attachments, m.reaction_count";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row.get(3)?,
        author_global_name: row.get(4)?,
        author_is_bot: row.get(5)?,
        content: row.get(6)?,
        clean_content: row.get(7)?,
        timestamp: row.get(8)?,
        edited_timestamp: row.get(9)?,
        message_type: row.get(10)?,
        reference_id: row.get(11)?,
        thread_id: row.get(12)?,
        has_embeds: row.get(13)?,
        has_attachments: row.get(14)?,
        reaction_count: row.get(15)?,
    })
}

fn processing_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingRow> {
    let raw: String = row.get(3)?;
    Ok(ProcessingRow {
        entity_type: row.get(0)?,
        entity_id: row.get(1)?,
        stage: row.get(2)?,
        result: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
        model_used: row.get(4)?,
        tokens_in: row.get(5)?,
        tokens_out: row.get(6)?,
        summary_date: row.get(7)?,
        processed_at: row.get(8)?,
    })
}

fn push_window<'a>(
    sql: &mut String,
    params: &mut Vec<&'a dyn ToSql>,
    window: &'a MessageWindow,
) {
    if let Some(channel) = &window.channel_id {
        sql.push_str(&format!(" AND m.channel_id = ?{}", params.len() + 1));
        params.push(channel);
    }
    if let Some(since) = &window.since {
        sql.push_str(&format!(" AND m.timestamp >= ?{}", params.len() + 1));
        params.push(since);
    }
    if let Some(until) = &window.until {
        sql.push_str(&format!(" AND m.timestamp <= ?{}", params.len() + 1));
        params.push(until);
    }
}

impl Database {
    /// Messages with no memoized row for `stage` (or a stale one, when
    /// `reprocess_after_days` is set; or all in-window messages, when
    /// `force`). Ordered by timestamp ascending.
    pub fn unprocessed_messages(
        &self,
        stage: Stage,
        window: &MessageWindow,
        force: bool,
        reprocess_after_days: Option<i64>,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let stage_name = stage.as_str().to_string();
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             JOIN users u ON u.id = m.author_id
             LEFT JOIN ai_processing p
                 ON p.entity_type = 'message' AND p.stage = ?1 AND p.entity_id = m.id
             WHERE 1 = 1"
        );
        let mut params: Vec<&dyn ToSql> = vec![&stage_name];

        let days = reprocess_after_days.unwrap_or(0);
        if !force {
            if reprocess_after_days.is_some() {
                sql.push_str(&format!(
                    " AND (p.id IS NULL OR p.processed_at < datetime('now', '-' || ?{} || ' days'))",
                    params.len() + 1
                ));
                params.push(&days);
            } else {
                sql.push_str(" AND p.id IS NULL");
            }
        }

        push_window(&mut sql, &mut params, window);
        sql.push_str(" ORDER BY m.timestamp ASC");
        if let Some(limit) = window.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&params[..], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Filter-kept messages that still lack a row for `stage`.
    pub fn kept_messages_without(
        &self,
        stage: Stage,
        window: &MessageWindow,
        force: bool,
        reprocess_after_days: Option<i64>,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let stage_name = stage.as_str().to_string();
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             JOIN users u ON u.id = m.author_id
             JOIN ai_processing f
                 ON f.entity_type = 'message' AND f.stage = 'filter' AND f.entity_id = m.id
             LEFT JOIN ai_processing p
                 ON p.entity_type = 'message' AND p.stage = ?1 AND p.entity_id = m.id
             WHERE json_extract(f.result_json, '$.keep') = 1"
        );
        let mut params: Vec<&dyn ToSql> = vec![&stage_name];

        let days = reprocess_after_days.unwrap_or(0);
        if !force {
            if reprocess_after_days.is_some() {
                sql.push_str(&format!(
                    " AND (p.id IS NULL OR p.processed_at < datetime('now', '-' || ?{} || ' days'))",
                    params.len() + 1
                ));
                params.push(&days);
            } else {
                sql.push_str(" AND p.id IS NULL");
            }
        }

        push_window(&mut sql, &mut params, window);
        sql.push_str(" ORDER BY m.timestamp ASC");
        if let Some(limit) = window.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&params[..], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Messages joined to their memoized payload for `stage`. The
    /// keep predicate is applied after the join.
    pub fn processed_messages(
        &self,
        stage: Stage,
        keep_only: bool,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<ProcessedMessage>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}, p.result_json
             FROM messages m
             JOIN users u ON u.id = m.author_id
             JOIN ai_processing p
                 ON p.entity_type = 'message' AND p.stage = ?1 AND p.entity_id = m.id"
        );
        if keep_only {
            sql.push_str(" WHERE json_extract(p.result_json, '$.keep') = 1");
        }
        sql.push_str(" ORDER BY m.timestamp ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([stage.as_str()], |row| {
            let raw: String = row.get(16)?;
            Ok(ProcessedMessage {
                message: message_from_row(row)?,
                result: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The memoization check: true when no row exists, the row is
    /// older than `reprocess_after_days`, or `force` is set.
    pub fn should_process(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        stage: Stage,
        force: bool,
        reprocess_after_days: Option<i64>,
    ) -> anyhow::Result<bool> {
        if force {
            return Ok(true);
        }
        let conn = self.conn();
        let fresh = match reprocess_after_days {
            Some(days) => conn
                .prepare(
                    "SELECT 1 FROM ai_processing
                     WHERE entity_type = ?1 AND entity_id = ?2 AND stage = ?3
                       AND processed_at > datetime('now', '-' || ?4 || ' days')",
                )?
                .exists(params![entity_type.as_str(), entity_id, stage.as_str(), days])?,
            None => conn
                .prepare(
                    "SELECT 1 FROM ai_processing
                     WHERE entity_type = ?1 AND entity_id = ?2 AND stage = ?3",
                )?
                .exists(params![entity_type.as_str(), entity_id, stage.as_str()])?,
        };
        Ok(!fresh)
    }

    /// Write one memoization row; conflicts replace the prior payload.
    pub fn record_processing(&self, write: &ProcessingWrite<'_>) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO ai_processing (
                 entity_type, entity_id, stage, result_json, model_used,
                 tokens_in, tokens_out, guild_id, channel_id, summary_date
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(entity_type, entity_id, stage) DO UPDATE SET
                 result_json = excluded.result_json,
                 model_used = excluded.model_used,
                 tokens_in = excluded.tokens_in,
                 tokens_out = excluded.tokens_out,
                 guild_id = excluded.guild_id,
                 channel_id = excluded.channel_id,
                 summary_date = excluded.summary_date,
                 processed_at = CURRENT_TIMESTAMP",
            params![
                write.entity_type.as_str(),
                write.entity_id,
                write.stage.as_str(),
                write.result.to_string(),
                write.model_used,
                write.tokens_in,
                write.tokens_out,
                write.guild_id,
                write.channel_id,
                write.summary_date,
            ],
        )?;
        Ok(())
    }

    pub fn get_processing(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        stage: Stage,
    ) -> anyhow::Result<Option<ProcessingRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT entity_type, entity_id, stage, result_json, model_used,
                        tokens_in, tokens_out, summary_date, processed_at
                 FROM ai_processing
                 WHERE entity_type = ?1 AND entity_id = ?2 AND stage = ?3",
                params![entity_type.as_str(), entity_id, stage.as_str()],
                processing_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Filter-kept messages for one channel within `[start, end)`.
    pub fn kept_messages_for_day(
        &self,
        channel_id: &str,
        start: &str,
        end: &str,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             JOIN users u ON u.id = m.author_id
             JOIN ai_processing f
                 ON f.entity_type = 'message' AND f.stage = 'filter' AND f.entity_id = m.id
             WHERE json_extract(f.result_json, '$.keep') = 1
               AND m.channel_id = ?1 AND m.timestamp >= ?2 AND m.timestamp < ?3
             ORDER BY m.timestamp ASC"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![channel_id, start, end], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Channels holding at least one kept message within `[start, end)`.
    pub fn channels_with_kept_messages(
        &self,
        start: &str,
        end: &str,
    ) -> anyhow::Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.id, c.name
             FROM channels c
             JOIN messages m ON m.channel_id = c.id
             JOIN ai_processing f
                 ON f.entity_type = 'message' AND f.stage = 'filter' AND f.entity_id = m.id
             WHERE json_extract(f.result_json, '$.keep') = 1
               AND m.timestamp >= ?1 AND m.timestamp < ?2
             ORDER BY c.id",
        )?;
        let rows = stmt.query_map(params![start, end], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Daily summary rows with `summary_date` in `[start, end]`
    /// (inclusive dates, `YYYY-MM-DD`).
    pub fn daily_summaries_between(
        &self,
        start: &str,
        end: &str,
    ) -> anyhow::Result<Vec<ProcessingRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT entity_type, entity_id, stage, result_json, model_used,
                    tokens_in, tokens_out, summary_date, processed_at
             FROM ai_processing
             WHERE entity_type = 'daily_summary' AND stage = 'summarize'
               AND summary_date >= ?1 AND summary_date <= ?2
             ORDER BY summary_date, entity_id",
        )?;
        let rows = stmt.query_map(params![start, end], processing_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All summary rows (daily and weekly), newest first; the export
    /// surface.
    pub fn summary_rows(&self, limit: Option<usize>) -> anyhow::Result<Vec<ProcessingRow>> {
        let mut sql = "SELECT entity_type, entity_id, stage, result_json, model_used,
                    tokens_in, tokens_out, summary_date, processed_at
             FROM ai_processing
             WHERE stage = 'summarize'
             ORDER BY processed_at DESC"
            .to_string();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], processing_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Candidates for extraction: filter-kept, and either not yet
    /// categorized or categorized as high/medium marketing relevance.
    /// Newest first.
    pub fn extract_candidates(
        &self,
        window: &MessageWindow,
    ) -> anyhow::Result<Vec<MessageRecord>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             JOIN users u ON u.id = m.author_id
             JOIN ai_processing f
                 ON f.entity_type = 'message' AND f.stage = 'filter' AND f.entity_id = m.id
             LEFT JOIN ai_processing c
                 ON c.entity_type = 'message' AND c.stage = 'categorize' AND c.entity_id = m.id
             WHERE json_extract(f.result_json, '$.keep') = 1
               AND (c.id IS NULL
                    OR json_extract(c.result_json, '$.marketing_relevance') IN ('high', 'medium'))"
        );
        let mut params: Vec<&dyn ToSql> = Vec::new();
        push_window(&mut sql, &mut params, window);
        sql.push_str(" ORDER BY m.timestamp DESC");
        sql.push_str(&format!(" LIMIT {}", window.limit.unwrap_or(200)));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&params[..], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn insert_extract(&self, write: &ExtractWrite<'_>) -> anyhow::Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO marketing_extracts (
                 source_type, source_id, extract_type, title, content,
                 relevance_score, sentiment, topics, requires_permission
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                write.source_type,
                write.source_id,
                write.extract_type,
                write.title,
                write.content,
                write.relevance_score,
                write.sentiment,
                write.topics.to_string(),
                write.requires_permission,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn extract_from_row(row: &Row<'_>) -> rusqlite::Result<ExtractRecord> {
        let topics: String = row.get(9)?;
        Ok(ExtractRecord {
            id: row.get(0)?,
            source_type: row.get(1)?,
            source_id: row.get(2)?,
            extract_type: row.get(3)?,
            title: row.get(4)?,
            content: row.get(5)?,
            formatted_content: row.get(6)?,
            relevance_score: row.get(7)?,
            sentiment: row.get(8)?,
            topics: serde_json::from_str(&topics).unwrap_or(serde_json::Value::Null),
            requires_permission: row.get(10)?,
            permission_granted: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    /// Extracts not yet rendered for social. The NULL column is the
    /// memo marker for the format stage.
    pub fn unformatted_extracts(&self, limit: usize) -> anyhow::Result<Vec<ExtractRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, source_type, source_id, extract_type, title, content,
                    formatted_content, relevance_score, sentiment, topics,
                    requires_permission, permission_granted, created_at
             FROM marketing_extracts
             WHERE formatted_content IS NULL
             ORDER BY created_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], Self::extract_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_extract_formatted(&self, id: i64, formatted: &str) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE marketing_extracts SET formatted_content = ?2 WHERE id = ?1",
            params![id, formatted],
        )?;
        Ok(())
    }

    pub fn extracts_by_type(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT extract_type, COUNT(*) FROM marketing_extracts
             GROUP BY extract_type ORDER BY extract_type",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Memoized row counts per stage, for `process status`.
    pub fn processing_status(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT stage, COUNT(*) FROM ai_processing GROUP BY stage ORDER BY stage",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop every memoized row for one stage so it runs fresh.
    pub fn reset_stage(&self, stage: Stage) -> anyhow::Result<usize> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM ai_processing WHERE stage = ?1", [stage.as_str()])?;
        Ok(n)
    }

    /// Raw messages in a window, oldest first; the export surface.
    pub fn messages_in_window(&self, window: &MessageWindow) -> anyhow::Result<Vec<MessageRecord>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             JOIN users u ON u.id = m.author_id
             WHERE 1 = 1"
        );
        let mut params: Vec<&dyn ToSql> = Vec::new();
        push_window(&mut sql, &mut params, window);
        sql.push_str(" ORDER BY m.timestamp ASC");
        if let Some(limit) = window.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&params[..], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn embeds_for(&self, message_id: &str) -> anyhow::Result<Vec<crate::db::EmbedInput>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT title, description, url FROM embeds WHERE message_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([message_id], |row| {
            Ok(crate::db::EmbedInput {
                title: row.get(0)?,
                description: row.get(1)?,
                url: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn attachments_for(
        &self,
        message_id: &str,
    ) -> anyhow::Result<Vec<crate::db::AttachmentInput>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, filename, url, size, content_type
             FROM attachments WHERE message_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([message_id], |row| {
            Ok(crate::db::AttachmentInput {
                id: row.get(0)?,
                filename: row.get(1)?,
                url: row.get(2)?,
                size: row.get(3)?,
                content_type: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn reactions_for(&self, message_id: &str) -> anyhow::Result<Vec<(String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT emoji, count FROM reactions WHERE message_id = ?1 ORDER BY emoji",
        )?;
        let rows = stmt.query_map([message_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn channels_overview(&self) -> anyhow::Result<Vec<crate::db::ChannelRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, guild_id, name, kind, parent_id, position, topic,
                    last_scraped_message_id, message_count
             FROM channels ORDER BY position, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(crate::db::ChannelRecord {
                id: row.get(0)?,
                guild_id: row.get(1)?,
                name: row.get(2)?,
                kind: row.get(3)?,
                parent_id: row.get(4)?,
                position: row.get(5)?,
                topic: row.get(6)?,
                last_scraped_message_id: row.get(7)?,
                message_count: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
