//! Summarize stage. Daily: one summary per (channel, day) over
//! filter-kept messages, memo-keyed `channel:date`. Weekly: a
//! guild-wide rollup of the week's daily summaries, selected by the
//! dedicated `summary_date` column.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::ai::schema;
use crate::db::{EntityKind, ProcessingWrite, Stage};

use super::{apply_privacy, prompt_items, BatchError, StageContext, StageOptions, StageReport};

pub async fn run(ctx: &StageContext, opts: &StageOptions) -> anyhow::Result<StageReport> {
    let mut report = StageReport::new(Stage::Summarize);
    run_daily(ctx, opts, &mut report).await?;
    if opts.week.is_some() {
        run_weekly(ctx, opts, &mut report).await?;
    }
    report.usage = ctx.usage.snapshot();
    Ok(report)
}

fn day_bounds(date: NaiveDate) -> (String, String) {
    (
        format!("{date}T00:00:00.000Z"),
        format!("{}T00:00:00.000Z", date + Duration::days(1)),
    )
}

async fn run_daily(
    ctx: &StageContext,
    opts: &StageOptions,
    report: &mut StageReport,
) -> anyhow::Result<()> {
    let date = opts
        .date
        .unwrap_or_else(|| (Utc::now() - Duration::days(1)).date_naive());
    let (start, end) = day_bounds(date);
    let date_key = date.to_string();

    let mut channels = ctx.db.channels_with_kept_messages(&start, &end)?;
    if let Some(wanted) = &opts.channel_id {
        channels.retain(|(id, _)| id == wanted);
    }
    info!(date = %date_key, channels = channels.len(), "running daily summaries");

    for (channel_id, channel_name) in channels {
        let entity_id = format!("{channel_id}:{date_key}");
        if !ctx.db.should_process(
            EntityKind::DailySummary,
            &entity_id,
            Stage::Summarize,
            opts.force,
            ctx.config.ai.reprocess_after_days,
        )? {
            continue;
        }

        let messages = ctx.db.kept_messages_for_day(&channel_id, &start, &end)?;
        if messages.is_empty() {
            continue;
        }
        report.candidates += 1;
        if opts.dry_run {
            report.dry_run = true;
            continue;
        }

        let mut items = prompt_items(&messages, false);
        apply_privacy(ctx, &mut items);

        let summarized = async {
            let prompt = ctx.prompts.render(
                "summarize_daily",
                &[
                    ("CHANNEL_NAME", json!(channel_name)),
                    ("DATE", json!(date_key)),
                    ("MESSAGES", serde_json::to_value(&items)?),
                ],
            )?;
            let outcome = ctx.driver.process_json(&prompt, &ctx.usage).await?;
            let parsed = schema::summarize_response(&outcome.value)?;
            anyhow::Ok((serde_json::to_value(&parsed)?, outcome))
        }
        .await;

        match summarized {
            Ok((result, outcome)) => {
                ctx.db.record_processing(&ProcessingWrite {
                    entity_type: EntityKind::DailySummary,
                    entity_id: &entity_id,
                    stage: Stage::Summarize,
                    result: &result,
                    model_used: &outcome.model,
                    tokens_in: Some(outcome.prompt_tokens as i64),
                    tokens_out: Some(outcome.completion_tokens as i64),
                    guild_id: Some(&ctx.guild_id),
                    channel_id: Some(&channel_id),
                    summary_date: Some(&date_key),
                })?;
                report.written += 1;
                report.processed += 1;
            }
            Err(error) => {
                warn!(channel = %channel_id, %error, "daily summary failed");
                report.errors.push(BatchError {
                    batch_index: report.candidates - 1,
                    error: error.to_string(),
                    ids: vec![entity_id],
                });
            }
        }
    }
    Ok(())
}

async fn run_weekly(
    ctx: &StageContext,
    opts: &StageOptions,
    report: &mut StageReport,
) -> anyhow::Result<()> {
    let week_start = opts.week.unwrap_or_else(|| monday_of(Utc::now().date_naive()));
    let week_end = week_start + Duration::days(6);
    let start_key = week_start.to_string();
    let end_key = week_end.to_string();

    let dailies = ctx.db.daily_summaries_between(&start_key, &end_key)?;
    if dailies.is_empty() {
        info!(week = %start_key, "no daily summaries in range; skipping weekly");
        return Ok(());
    }

    let entity_id = format!("{}:week:{start_key}", ctx.guild_id);
    if !ctx.db.should_process(
        EntityKind::WeeklySummary,
        &entity_id,
        Stage::Summarize,
        opts.force,
        ctx.config.ai.reprocess_after_days,
    )? {
        return Ok(());
    }
    report.candidates += 1;
    if opts.dry_run {
        report.dry_run = true;
        return Ok(());
    }

    let inputs: Vec<serde_json::Value> = dailies
        .iter()
        .map(|row| {
            json!({
                "channel": row.entity_id.split(':').next().unwrap_or(&row.entity_id),
                "date": &row.summary_date,
                "summary": &row.result["summary"],
            })
        })
        .collect();

    let summarized = async {
        let prompt = ctx.prompts.render(
            "summarize_weekly",
            &[
                ("WEEK_START", json!(start_key)),
                ("WEEK_END", json!(end_key)),
                ("DAILY_SUMMARIES", serde_json::Value::Array(inputs)),
            ],
        )?;
        let outcome = ctx.driver.process_json(&prompt, &ctx.usage).await?;
        let parsed = schema::summarize_response(&outcome.value)?;
        anyhow::Ok((serde_json::to_value(&parsed)?, outcome))
    }
    .await;

    match summarized {
        Ok((result, outcome)) => {
            ctx.db.record_processing(&ProcessingWrite {
                entity_type: EntityKind::WeeklySummary,
                entity_id: &entity_id,
                stage: Stage::Summarize,
                result: &result,
                model_used: &outcome.model,
                tokens_in: Some(outcome.prompt_tokens as i64),
                tokens_out: Some(outcome.completion_tokens as i64),
                guild_id: Some(&ctx.guild_id),
                channel_id: None,
                summary_date: Some(&start_key),
            })?;
            report.written += 1;
            report.processed += 1;
        }
        Err(error) => {
            warn!(week = %start_key, %error, "weekly summary failed");
            report.errors.push(BatchError {
                batch_index: report.candidates.saturating_sub(1),
                error: error.to_string(),
                ids: vec![entity_id],
            });
        }
    }
    Ok(())
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}
