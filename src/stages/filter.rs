//! Filter stage: every message not yet decided gets a keep/discard
//! verdict persisted against its original id.

use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};

use crate::ai::schema::{self, FilterDecision};
use crate::ai::PromptMessage;
use crate::db::{EntityKind, ProcessingWrite, Stage};

use super::{
    apply_privacy, prompt_items, split_tokens, BatchError, StageContext, StageOptions, StageReport,
};

pub async fn run(ctx: &StageContext, opts: &StageOptions) -> anyhow::Result<StageReport> {
    let mut report = StageReport::new(Stage::Filter);

    let candidates = ctx.db.unprocessed_messages(
        Stage::Filter,
        &opts.window(),
        opts.force,
        ctx.config.ai.reprocess_after_days,
    )?;
    report.candidates = candidates.len();
    if candidates.is_empty() {
        return Ok(report);
    }

    let mut items = prompt_items(&candidates, false);
    apply_privacy(ctx, &mut items);
    let batches = crate::ai::tokens::create_batches(
        items,
        ctx.config.ai.max_tokens_per_batch,
        ctx.config.ai.batch_size,
    );
    report.batches = batches.len();
    info!(candidates = report.candidates, batches = report.batches, "running filter stage");

    if opts.dry_run {
        report.dry_run = true;
        return Ok(report);
    }

    for (batch_index, batch) in batches.iter().enumerate() {
        match filter_batch(ctx, batch).await {
            Ok(decisions) => {
                for decision in decisions {
                    report.processed += 1;
                    if decision.keep {
                        report.kept += 1;
                    } else {
                        report.discarded += 1;
                    }
                }
            }
            Err(error) => {
                warn!(batch_index, %error, "filter batch failed");
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

/// One LLM round trip; returns the decisions actually persisted.
async fn filter_batch(
    ctx: &StageContext,
    batch: &[PromptMessage],
) -> anyhow::Result<Vec<FilterDecision>> {
    let prompt = ctx
        .prompts
        .render("filter", &[("MESSAGES", serde_json::to_value(batch)?)])?;
    let outcome = ctx.driver.process_json(&prompt, &ctx.usage).await?;
    let parsed = schema::filter_response(&outcome.value)?;

    let known: HashSet<&str> = batch.iter().map(|item| item.id.as_str()).collect();
    let matched: Vec<FilterDecision> = parsed
        .decisions
        .into_iter()
        .filter(|decision| {
            let ok = known.contains(decision.id.as_str());
            if !ok {
                warn!(id = %decision.id, "model invented a message id; dropping decision");
            }
            ok
        })
        .collect();

    let tokens_in = split_tokens(outcome.prompt_tokens, matched.len());
    let tokens_out = split_tokens(outcome.completion_tokens, matched.len());
    for decision in &matched {
        let result = json!({
            "keep": decision.keep,
            "reason": &decision.reason,
            "quality_score": decision.quality_score,
        });
        ctx.db.record_processing(&ProcessingWrite {
            entity_type: EntityKind::Message,
            entity_id: &decision.id,
            stage: Stage::Filter,
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
