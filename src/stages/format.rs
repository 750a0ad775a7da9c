//! Format stage: renders pending extracts into social-ready copy.
//! `formatted_content IS NULL` is the memo marker, so completed rows
//! drop out of the candidate set on their own.

use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};

use crate::ai::schema;
use crate::db::{ExtractRecord, Stage};

use super::{BatchError, StageContext, StageOptions, StageReport};

const DEFAULT_LIMIT: usize = 50;

pub async fn run(ctx: &StageContext, opts: &StageOptions) -> anyhow::Result<StageReport> {
    let mut report = StageReport::new(Stage::Format);

    let pending = ctx
        .db
        .unformatted_extracts(opts.limit.unwrap_or(DEFAULT_LIMIT))?;
    report.candidates = pending.len();
    if pending.is_empty() {
        return Ok(report);
    }

    let payloads: Vec<serde_json::Value> = pending.iter().map(payload).collect();
    let batches = crate::ai::tokens::create_batches(
        payloads,
        ctx.config.ai.max_tokens_per_batch,
        ctx.config.ai.batch_size,
    );
    report.batches = batches.len();
    info!(candidates = report.candidates, batches = report.batches, "running format stage");

    if opts.dry_run {
        report.dry_run = true;
        return Ok(report);
    }

    let known: HashSet<i64> = pending.iter().map(|extract| extract.id).collect();
    for (batch_index, batch) in batches.iter().enumerate() {
        match format_batch(ctx, batch, &known).await {
            Ok(written) => report.written += written,
            Err(error) => {
                warn!(batch_index, %error, "format batch failed");
                report.errors.push(BatchError {
                    batch_index,
                    error: error.to_string(),
                    ids: batch
                        .iter()
                        .filter_map(|value| value["id"].as_i64())
                        .map(|id| id.to_string())
                        .collect(),
                });
            }
        }
    }

    report.usage = ctx.usage.snapshot();
    Ok(report)
}

fn payload(extract: &ExtractRecord) -> serde_json::Value {
    json!({
        "id": extract.id,
        "type": &extract.extract_type,
        "sentiment": &extract.sentiment,
        "content": &extract.content,
    })
}

async fn format_batch(
    ctx: &StageContext,
    batch: &[serde_json::Value],
    known_ids: &HashSet<i64>,
) -> anyhow::Result<usize> {
    let prompt = ctx.prompts.render(
        "format_social",
        &[("EXTRACTS", serde_json::Value::Array(batch.to_vec()))],
    )?;
    let outcome = ctx.driver.process_json(&prompt, &ctx.usage).await?;
    let parsed = schema::format_response(&outcome.value)?;

    let mut written = 0usize;
    for item in &parsed.formatted {
        let Some(row_id) = item.row_id().filter(|id| known_ids.contains(id)) else {
            warn!("formatted item without a known extract id; dropping");
            continue;
        };
        ctx.db.set_extract_formatted(row_id, &item.formatted_content)?;
        written += 1;
    }
    Ok(written)
}
