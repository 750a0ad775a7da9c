//! Export writers: messages, channels, and summaries rendered to
//! JSON or CSV. The CLI decides where the rendered string goes.

use serde_json::{json, Value};

use crate::db::{Database, MessageWindow, ProcessingRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => anyhow::bail!("unknown export format '{other}' (expected json or csv)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
    pub include_embeds: bool,
    pub include_attachments: bool,
    pub include_reactions: bool,
    pub pretty: bool,
}

impl ExportOptions {
    fn window(&self) -> MessageWindow {
        MessageWindow {
            channel_id: None,
            since: self.since.clone(),
            until: self.until.clone(),
            limit: self.limit,
        }
    }
}

pub fn export_messages(
    db: &Database,
    format: ExportFormat,
    opts: &ExportOptions,
) -> anyhow::Result<String> {
    let messages = db.messages_in_window(&opts.window())?;

    match format {
        ExportFormat::Json => {
            let mut rows = Vec::with_capacity(messages.len());
            for message in &messages {
                let mut row = serde_json::to_value(message)?;
                if opts.include_embeds {
                    let embeds: Vec<Value> = db
                        .embeds_for(&message.id)?
                        .into_iter()
                        .map(|e| json!({"title": e.title, "description": e.description, "url": e.url}))
                        .collect();
                    row["embeds"] = Value::Array(embeds);
                }
                if opts.include_attachments {
                    let attachments: Vec<Value> = db
                        .attachments_for(&message.id)?
                        .into_iter()
                        .map(|a| {
                            json!({"id": a.id, "filename": a.filename, "url": a.url,
                                   "size": a.size, "content_type": a.content_type})
                        })
                        .collect();
                    row["attachments"] = Value::Array(attachments);
                }
                if opts.include_reactions {
                    let reactions: Vec<Value> = db
                        .reactions_for(&message.id)?
                        .into_iter()
                        .map(|(emoji, count)| json!({"emoji": emoji, "count": count}))
                        .collect();
                    row["reactions"] = Value::Array(reactions);
                }
                rows.push(row);
            }
            render_json(&Value::Array(rows), opts.pretty)
        }
        ExportFormat::Csv => {
            let mut out = String::from(
                "id,channel_id,author_id,author_username,timestamp,edited_timestamp,\
                 reaction_count,has_embeds,has_attachments,content\n",
            );
            for message in &messages {
                let fields = [
                    message.id.as_str(),
                    message.channel_id.as_str(),
                    message.author_id.as_str(),
                    message.author_username.as_str(),
                    message.timestamp.as_str(),
                    message.edited_timestamp.as_deref().unwrap_or(""),
                    &message.reaction_count.to_string(),
                    bool_field(message.has_embeds),
                    bool_field(message.has_attachments),
                    message.clean_content.as_str(),
                ];
                push_csv_row(&mut out, &fields);
            }
            Ok(out)
        }
    }
}

pub fn export_channels(db: &Database, format: ExportFormat, pretty: bool) -> anyhow::Result<String> {
    let channels = db.channels_overview()?;
    match format {
        ExportFormat::Json => render_json(&serde_json::to_value(&channels)?, pretty),
        ExportFormat::Csv => {
            let mut out = String::from(
                "id,guild_id,name,kind,parent_id,position,topic,last_scraped_message_id,message_count\n",
            );
            for channel in &channels {
                let fields = [
                    channel.id.as_str(),
                    channel.guild_id.as_str(),
                    channel.name.as_str(),
                    &channel.kind.to_string(),
                    channel.parent_id.as_deref().unwrap_or(""),
                    &channel.position.map(|p| p.to_string()).unwrap_or_default(),
                    channel.topic.as_deref().unwrap_or(""),
                    channel.last_scraped_message_id.as_deref().unwrap_or(""),
                    &channel.message_count.to_string(),
                ];
                push_csv_row(&mut out, &fields);
            }
            Ok(out)
        }
    }
}

pub fn export_summaries(
    db: &Database,
    format: ExportFormat,
    limit: Option<usize>,
    pretty: bool,
) -> anyhow::Result<String> {
    let rows = db.summary_rows(limit)?;
    match format {
        ExportFormat::Json => {
            let values: Vec<Value> = rows.iter().map(summary_json).collect();
            render_json(&Value::Array(values), pretty)
        }
        ExportFormat::Csv => {
            let mut out =
                String::from("entity_type,entity_id,summary_date,headline,model_used,processed_at\n");
            for row in &rows {
                let headline = row.result["summary"]["headline"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let fields = [
                    row.entity_type.as_str(),
                    row.entity_id.as_str(),
                    row.summary_date.as_deref().unwrap_or(""),
                    headline.as_str(),
                    row.model_used.as_str(),
                    row.processed_at.as_str(),
                ];
                push_csv_row(&mut out, &fields);
            }
            Ok(out)
        }
    }
}

fn summary_json(row: &ProcessingRow) -> Value {
    json!({
        "entity_type": &row.entity_type,
        "entity_id": &row.entity_id,
        "summary_date": &row.summary_date,
        "summary": &row.result["summary"],
        "model_used": &row.model_used,
        "processed_at": &row.processed_at,
    })
}

fn render_json(value: &Value, pretty: bool) -> anyhow::Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    })
}

fn bool_field(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// RFC 4180 quoting: fields containing commas, quotes, or newlines
/// are wrapped, with inner quotes doubled.
fn push_csv_row(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::test_fixtures::{self, seeded};
    use crate::db::{EntityKind, ProcessingWrite, Stage};

    fn seed_message(db: &Database, id: &str, content: &str) {
        let mut message = test_fixtures::message(id, "c1", "u1", "2024-06-15T10:00:00.000Z");
        message.content = content.to_string();
        message.clean_content = content.to_string();
        db.upsert_message(&message).unwrap();
    }

    #[test]
    fn test_csv_escaping() {
        let mut out = String::new();
        push_csv_row(&mut out, &["plain", "with,comma", "with \"quote\"", "multi\nline"]);
        assert_eq!(
            out,
            "plain,\"with,comma\",\"with \"\"quote\"\"\",\"multi\nline\"\n"
        );
    }

    #[test]
    fn test_export_messages_csv_has_header_and_rows() {
        let db = seeded();
        seed_message(&db, "m1", "hello, world");

        let csv = export_messages(&db, ExportFormat::Csv, &ExportOptions::default()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,channel_id"));
        assert!(lines[1].contains("\"hello, world\""));
    }

    #[test]
    fn test_export_messages_json_with_children() {
        let db = seeded();
        seed_message(&db, "m1", "hi");
        db.upsert_reaction("m1", "🎉", 4).unwrap();

        let opts = ExportOptions {
            include_reactions: true,
            ..ExportOptions::default()
        };
        let rendered = export_messages(&db, ExportFormat::Json, &opts).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["id"], json!("m1"));
        assert_eq!(parsed[0]["reactions"][0]["count"], json!(4));
    }

    #[test]
    fn test_export_messages_respects_window() {
        let db = seeded();
        seed_message(&db, "m1", "old");
        let mut late = test_fixtures::message("m2", "c1", "u1", "2024-06-20T10:00:00.000Z");
        late.clean_content = "new".to_string();
        db.upsert_message(&late).unwrap();

        let opts = ExportOptions {
            since: Some("2024-06-18T00:00:00.000Z".to_string()),
            ..ExportOptions::default()
        };
        let rendered = export_messages(&db, ExportFormat::Json, &opts).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
        assert_eq!(parsed[0]["id"], json!("m2"));
    }

    #[test]
    fn test_export_summaries() {
        let db = seeded();
        let payload = json!({"summary": {"headline": "good, day", "key_points": []}});
        db.record_processing(&ProcessingWrite {
            entity_type: EntityKind::DailySummary,
            entity_id: "c1:2024-06-15",
            stage: Stage::Summarize,
            result: &payload,
            model_used: "test-model",
            tokens_in: None,
            tokens_out: None,
            guild_id: Some("g1"),
            channel_id: Some("c1"),
            summary_date: Some("2024-06-15"),
        })
        .unwrap();

        let csv = export_summaries(&db, ExportFormat::Csv, None, false).unwrap();
        assert!(csv.contains("\"good, day\""));

        let rendered = export_summaries(&db, ExportFormat::Json, None, true).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["entity_id"], json!("c1:2024-06-15"));
        assert_eq!(parsed[0]["summary"]["headline"], json!("good, day"));
    }

    #[test]
    fn test_export_channels_json() {
        let db = seeded();
        let rendered = export_channels(&db, ExportFormat::Json, false).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["id"], json!("c1"));
    }
}
