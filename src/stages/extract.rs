//! Extract stage: three independent sub-extractors (quote,
//! announcement, faq) mine high-relevance kept messages and append
//! typed rows to the marketing extracts table. An error in one kind
//! never stops the others.

use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};

use crate::ai::schema::{self, ExtractItem};
use crate::ai::PromptMessage;
use crate::db::{ExtractWrite, Stage};

use super::{
    apply_privacy, prompt_items, BatchError, StageContext, StageOptions, StageReport,
};

const DEFAULT_CANDIDATE_LIMIT: usize = 100;
const DEFAULT_RELEVANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
enum ExtractorKind {
    Quote,
    Announcement,
    Faq,
}

impl ExtractorKind {
    const ALL: [ExtractorKind; 3] = [
        ExtractorKind::Quote,
        ExtractorKind::Announcement,
        ExtractorKind::Faq,
    ];

    fn template(&self) -> &'static str {
        match self {
            ExtractorKind::Quote => "extract_quote",
            ExtractorKind::Announcement => "extract_announcement",
            ExtractorKind::Faq => "extract_faq",
        }
    }

    fn extract_type(&self) -> &'static str {
        match self {
            ExtractorKind::Quote => "quote",
            ExtractorKind::Announcement => "announcement",
            ExtractorKind::Faq => "faq",
        }
    }

    /// Type-specific defaults for fields the model may omit.
    fn default_sentiment(&self) -> &'static str {
        match self {
            ExtractorKind::Quote => "positive",
            ExtractorKind::Announcement | ExtractorKind::Faq => "neutral",
        }
    }

    fn default_requires_permission(&self) -> bool {
        matches!(self, ExtractorKind::Quote)
    }
}

pub async fn run(ctx: &StageContext, opts: &StageOptions) -> anyhow::Result<StageReport> {
    let mut report = StageReport::new(Stage::Extract);

    let mut window = opts.window();
    window.limit = Some(window.limit.unwrap_or(DEFAULT_CANDIDATE_LIMIT));
    let candidates = ctx.db.extract_candidates(&window)?;
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
    info!(candidates = report.candidates, batches = report.batches, "running extract stage");

    if opts.dry_run {
        report.dry_run = true;
        return Ok(report);
    }

    let known: HashSet<String> = candidates.iter().map(|m| m.id.clone()).collect();
    let mut batch_index = 0usize;
    for kind in ExtractorKind::ALL {
        for batch in &batches {
            match extract_batch(ctx, kind, batch, &known).await {
                Ok(written) => {
                    report.written += written;
                    if written > 0 {
                        *report
                            .extract_types
                            .entry(kind.extract_type().to_string())
                            .or_default() += written;
                    }
                }
                Err(error) => {
                    warn!(kind = kind.extract_type(), batch_index, %error, "extract batch failed");
                    report.errors.push(BatchError {
                        batch_index,
                        error: format!("{}: {error}", kind.extract_type()),
                        ids: batch.iter().map(|item| item.id.clone()).collect(),
                    });
                }
            }
            batch_index += 1;
        }
    }

    report.usage = ctx.usage.snapshot();
    Ok(report)
}

async fn extract_batch(
    ctx: &StageContext,
    kind: ExtractorKind,
    batch: &[PromptMessage],
    known_ids: &HashSet<String>,
) -> anyhow::Result<usize> {
    let prompt = ctx
        .prompts
        .render(kind.template(), &[("MESSAGES", serde_json::to_value(batch)?)])?;
    let outcome = ctx.driver.process_json(&prompt, &ctx.usage).await?;
    let parsed = schema::extract_response(&outcome.value)?;

    let mut written = 0usize;
    for item in &parsed.extracts {
        let Some(source_id) = usable_source(item, known_ids) else {
            warn!(kind = kind.extract_type(), "extract without a known source message; dropping");
            continue;
        };

        let topics = json!([]);
        ctx.db.insert_extract(&ExtractWrite {
            source_type: "message",
            source_id,
            extract_type: kind.extract_type(),
            title: item.title.as_deref(),
            content: &item.content,
            relevance_score: item.relevance_score.unwrap_or(DEFAULT_RELEVANCE),
            sentiment: kind.default_sentiment(),
            topics: &topics,
            requires_permission: item
                .requires_permission
                .unwrap_or_else(|| kind.default_requires_permission()),
        })?;
        written += 1;
    }
    Ok(written)
}

/// Extracts must key on an original message id the batch actually
/// contained.
fn usable_source<'a>(item: &'a ExtractItem, known_ids: &HashSet<String>) -> Option<&'a str> {
    item.source_message_id
        .as_deref()
        .filter(|id| known_ids.contains(*id))
}
