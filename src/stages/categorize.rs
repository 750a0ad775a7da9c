//! Categorize stage: filter-kept messages get topic, sentiment,
//! urgency, and marketing-relevance tags.

use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};

use crate::ai::schema::{self, Categorization};
use crate::ai::PromptMessage;
use crate::db::{EntityKind, ProcessingWrite, Stage};

use super::{
    apply_privacy, prompt_items, split_tokens, BatchError, StageContext, StageOptions, StageReport,
};

pub async fn run(ctx: &StageContext, opts: &StageOptions) -> anyhow::Result<StageReport> {
    let mut report = StageReport::new(Stage::Categorize);

    let candidates = ctx.db.kept_messages_without(
        Stage::Categorize,
        &opts.window(),
        opts.force,
        ctx.config.ai.reprocess_after_days,
    )?;
    report.candidates = candidates.len();
    if candidates.is_empty() {
        return Ok(report);
    }

    let mut items = prompt_items(&candidates, true);
    apply_privacy(ctx, &mut items);
    let batches = crate::ai::tokens::create_batches(
        items,
        ctx.config.ai.max_tokens_per_batch,
        ctx.config.ai.batch_size,
    );
    report.batches = batches.len();
    info!(candidates = report.candidates, batches = report.batches, "running categorize stage");

    if opts.dry_run {
        report.dry_run = true;
        return Ok(report);
    }

    for (batch_index, batch) in batches.iter().enumerate() {
        match categorize_batch(ctx, batch).await {
            Ok(rows) => {
                for row in rows {
                    report.processed += 1;
                    *report.topics.entry(row.primary_topic.clone()).or_default() += 1;
                    *report
                        .sentiments
                        .entry(row.sentiment.as_str().to_string())
                        .or_default() += 1;
                    *report
                        .relevance
                        .entry(row.marketing_relevance.as_str().to_string())
                        .or_default() += 1;
                }
            }
            Err(error) => {
                warn!(batch_index, %error, "categorize batch failed");
                report.errors.push(BatchError {
                    batch_index,
                    error: error.to_string(),
                    ids: batch.iter().map(|item| item.id.clone()).collect(),
                });
            }
        }
    }

    report.usage = ctx.usage.snapshot();
    Ok(report)
}

async fn categorize_batch(
    ctx: &StageContext,
    batch: &[PromptMessage],
) -> anyhow::Result<Vec<Categorization>> {
    let prompt = ctx
        .prompts
        .render("categorize", &[("MESSAGES", serde_json::to_value(batch)?)])?;
    let outcome = ctx.driver.process_json(&prompt, &ctx.usage).await?;
    let parsed = schema::categorize_response(&outcome.value)?;

    let known: HashSet<&str> = batch.iter().map(|item| item.id.as_str()).collect();
    let matched: Vec<Categorization> = parsed
        .categorizations
        .into_iter()
        .filter(|row| {
            let ok = known.contains(row.id.as_str());
            if !ok {
                warn!(id = %row.id, "model invented a message id; dropping categorization");
            }
            ok
        })
        .collect();

    let tokens_in = split_tokens(outcome.prompt_tokens, matched.len());
    let tokens_out = split_tokens(outcome.completion_tokens, matched.len());
    for row in &matched {
        let result = json!({
            "primary_topic": &row.primary_topic,
            "secondary_topics": &row.secondary_topics,
            "sentiment": row.sentiment.as_str(),
            "urgency": row.urgency.as_str(),
            "marketing_relevance": row.marketing_relevance.as_str(),
        });
        ctx.db.record_processing(&ProcessingWrite {
            entity_type: EntityKind::Message,
            entity_id: &row.id,
            stage: Stage::Categorize,
            result: &result,
            model_used: &outcome.model,
            tokens_in,
            tokens_out,
            guild_id: None,
            channel_id: None,
            summary_date: None,
        })?;
    }
    Ok(matched)
}
