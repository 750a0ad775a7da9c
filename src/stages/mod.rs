//! The staged processing engine. Stages run in a fixed order —
//! filter → categorize → summarize → extract → format — each reading
//! its predecessors' memoized output from the store and writing its
//! own. Failures are batch-granular: a bad batch lands in the report
//! and the run keeps going.

pub mod categorize;
pub mod extract;
pub mod filter;
pub mod format;
pub mod summarize;

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::ai::{anonymize_messages, LlmDriver, PromptMessage, PromptStore, UsageTotals, UsageTracker};
use crate::config::Config;
use crate::db::{Database, MessageRecord, MessageWindow, Stage};

/// Everything a stage needs, threaded explicitly so tests can build
/// parallel instances with stub backends.
pub struct StageContext {
    pub db: Database,
    pub driver: LlmDriver,
    pub prompts: PromptStore,
    pub config: Config,
    pub guild_id: String,
    pub usage: UsageTracker,
}

impl StageContext {
    pub fn new(db: Database, driver: LlmDriver, prompts: PromptStore, config: Config) -> Self {
        let guild_id = config
            .discord
            .guild_id
            .clone()
            .unwrap_or_else(|| "guild".to_string());
        Self {
            db,
            driver,
            prompts,
            config,
            guild_id,
            usage: UsageTracker::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    pub channel_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
    pub force: bool,
    pub dry_run: bool,
    /// Target day for daily summaries; defaults to yesterday.
    pub date: Option<NaiveDate>,
    /// Week start (Monday) enabling the weekly rollup.
    pub week: Option<NaiveDate>,
}

impl StageOptions {
    pub fn window(&self) -> MessageWindow {
        MessageWindow {
            channel_id: self.channel_id.clone(),
            since: self.since.clone(),
            until: self.until.clone(),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchError {
    pub batch_index: usize,
    pub error: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub candidates: usize,
    pub batches: usize,
    pub processed: usize,
    pub kept: usize,
    pub discarded: usize,
    pub written: usize,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub topics: HashMap<String, usize>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub sentiments: HashMap<String, usize>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub relevance: HashMap<String, usize>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extract_types: HashMap<String, usize>,
    pub errors: Vec<BatchError>,
    pub dry_run: bool,
    pub usage: UsageTotals,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage: stage.as_str(),
            ..Self::default()
        }
    }
}

pub async fn run_stage(
    ctx: &StageContext,
    stage: Stage,
    opts: &StageOptions,
) -> anyhow::Result<StageReport> {
    match stage {
        Stage::Filter => filter::run(ctx, opts).await,
        Stage::Categorize => categorize::run(ctx, opts).await,
        Stage::Summarize => summarize::run(ctx, opts).await,
        Stage::Extract => extract::run(ctx, opts).await,
        Stage::Format => format::run(ctx, opts).await,
    }
}

/// Walk the registry in order, honoring per-stage config toggles.
pub async fn run_all(ctx: &StageContext, opts: &StageOptions) -> anyhow::Result<Vec<StageReport>> {
    let mut reports = Vec::new();
    for stage in Stage::ALL {
        if !ctx.config.stage_enabled(stage.as_str()) {
            tracing::info!(stage = stage.as_str(), "stage disabled; skipping");
            continue;
        }
        reports.push(run_stage(ctx, stage, opts).await?);
    }
    Ok(reports)
}

pub(crate) fn prompt_items(records: &[MessageRecord], with_signals: bool) -> Vec<PromptMessage> {
    records
        .iter()
        .map(|record| {
            if with_signals {
                PromptMessage::with_signals(record)
            } else {
                PromptMessage::from_record(record)
            }
        })
        .collect()
}

pub(crate) fn apply_privacy(ctx: &StageContext, items: &mut [PromptMessage]) {
    if ctx.config.privacy.anonymize_in_prompts {
        anonymize_messages(items, true);
    }
}

/// Spread a batch's token usage evenly over its rows.
pub(crate) fn split_tokens(total: u32, rows: usize) -> Option<i64> {
    if rows == 0 {
        return None;
    }
    Some((total as usize / rows) as i64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;
    use crate::ai::testing::StubBackend;
    use crate::ai::RetryPolicy;
    use crate::db::test_fixtures;
    use crate::db::{EntityKind, ProcessingWrite};

    fn ctx_with(db: Database, backend: Arc<StubBackend>) -> StageContext {
        let mut config = Config::default();
        config.discord.guild_id = Some("g1".to_string());
        let driver = LlmDriver::new(
            backend,
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                multiplier: 2.0,
            },
            "test-model",
            512,
        );
        StageContext::new(db, driver, PromptStore::builtin(), config)
    }

    fn seed_messages(db: &Database, ids: &[&str]) {
        for (i, id) in ids.iter().enumerate() {
            db.upsert_message(&test_fixtures::message(
                id,
                "c1",
                "u1",
                &format!("2024-06-15T10:00:0{i}.000Z"),
            ))
            .unwrap();
        }
    }

    fn mark_kept(db: &Database, ids: &[&str]) {
        for id in ids {
            let result = json!({"keep": true});
            db.record_processing(&ProcessingWrite {
                entity_type: EntityKind::Message,
                entity_id: id,
                stage: Stage::Filter,
                result: &result,
                model_used: "test-model",
                tokens_in: None,
                tokens_out: None,
                guild_id: None,
                channel_id: None,
                summary_date: None,
            })
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_filter_then_categorize_flow() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1", "m2", "m3"]);

        let backend = Arc::new(StubBackend::new());
        backend.push_json(json!({"decisions": [
            {"id": "m1", "keep": true, "quality_score": 0.9},
            {"id": "m2", "keep": false, "reason": "noise"},
            {"id": "m3", "keep": true}
        ]}));
        let ctx = ctx_with(db, backend.clone());

        let report = filter::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.kept, 2);
        assert_eq!(report.discarded, 1);
        assert!(report.errors.is_empty());

        backend.push_json(json!({"categorizations": [
            {"id": "m1", "primary_topic": "A", "sentiment": "positive",
             "urgency": "low", "marketing_relevance": "high"},
            {"id": "m3", "primary_topic": "B", "sentiment": "neutral",
             "urgency": "medium", "marketing_relevance": "medium"}
        ]}));
        let report = categorize::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(report.candidates, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.topics.get("A"), Some(&1));
        assert_eq!(report.topics.get("B"), Some(&1));

        // Exactly two categorize rows: m1 and m3, none for m2.
        for (id, expect) in [("m1", true), ("m2", false), ("m3", true)] {
            let row = ctx
                .db
                .get_processing(EntityKind::Message, id, Stage::Categorize)
                .unwrap();
            assert_eq!(row.is_some(), expect, "{id}");
        }
    }

    #[tokio::test]
    async fn test_filter_memoization_skips_second_run() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1"]);

        let backend = Arc::new(StubBackend::new());
        backend.push_json(json!({"decisions": [{"id": "m1", "keep": true}]}));
        let ctx = ctx_with(db, backend.clone());

        filter::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(backend.calls(), 1);

        // No second LLM call without force.
        let report = filter::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(backend.calls(), 1);

        // Force reprocesses.
        backend.push_json(json!({"decisions": [{"id": "m1", "keep": false}]}));
        let opts = StageOptions {
            force: true,
            ..StageOptions::default()
        };
        let report = filter::run(&ctx, &opts).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_lands_in_errors() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1"]);

        let backend = Arc::new(StubBackend::always_status(429));
        let ctx = ctx_with(db, backend.clone());

        let report = filter::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(backend.calls(), 3);
        assert_eq!(report.processed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].error.contains("429"));
        assert_eq!(report.errors[0].ids, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_validation_failure_isolated_per_batch() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1", "m2"]);

        let backend = Arc::new(StubBackend::new());
        // First batch: malformed (keep missing). Second: fine.
        backend.push_json(json!({"decisions": [{"id": "m1"}]}));
        backend.push_json(json!({"decisions": [{"id": "m2", "keep": true}]}));

        let mut ctx = ctx_with(db, backend.clone());
        ctx.config.ai.batch_size = 1;

        let report = filter::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].batch_index, 0);
        assert_eq!(report.processed, 1);
        assert!(ctx
            .db
            .get_processing(EntityKind::Message, "m2", Stage::Filter)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_anonymization_hides_names_keeps_ids() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1"]);

        let backend = Arc::new(StubBackend::new());
        backend.push_json(json!({"decisions": [{"id": "m1", "keep": true}]}));
        let ctx = ctx_with(db, backend.clone());
        assert!(ctx.config.privacy.anonymize_in_prompts);

        filter::run(&ctx, &StageOptions::default()).await.unwrap();

        let prompts = backend.prompts();
        assert!(prompts[0].contains("User_A"));
        assert!(!prompts[0].contains("alice"));

        // Persisted row keys on the original message id.
        assert!(ctx
            .db
            .get_processing(EntityKind::Message, "m1", Stage::Filter)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_daily_summary_key_and_memoization() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1", "m2", "m3", "m4", "m5"]);
        mark_kept(&db, &["m1", "m2", "m3", "m4", "m5"]);

        let backend = Arc::new(StubBackend::new());
        backend.push_json(json!({"summary": {
            "headline": "busy day", "key_points": ["launch talk"]
        }}));
        let ctx = ctx_with(db, backend.clone());

        let opts = StageOptions {
            date: NaiveDate::from_ymd_opt(2024, 6, 15),
            ..StageOptions::default()
        };
        let report = summarize::run(&ctx, &opts).await.unwrap();
        assert_eq!(report.written, 1);

        let row = ctx
            .db
            .get_processing(EntityKind::DailySummary, "c1:2024-06-15", Stage::Summarize)
            .unwrap()
            .expect("daily summary row");
        assert_eq!(row.summary_date.as_deref(), Some("2024-06-15"));
        assert_eq!(row.result["summary"]["headline"], json!("busy day"));

        // Memoized: second run makes no further calls.
        let report = summarize::run(&ctx, &opts).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_weekly_rollup_from_dailies() {
        let db = test_fixtures::seeded();
        let backend = Arc::new(StubBackend::new());
        let ctx = ctx_with(db, backend.clone());

        let payload = json!({"summary": {"headline": "day", "key_points": []}});
        for date in ["2024-06-10", "2024-06-12"] {
            ctx.db
                .record_processing(&ProcessingWrite {
                    entity_type: EntityKind::DailySummary,
                    entity_id: &format!("c1:{date}"),
                    stage: Stage::Summarize,
                    result: &payload,
                    model_used: "test-model",
                    tokens_in: None,
                    tokens_out: None,
                    guild_id: Some("g1"),
                    channel_id: Some("c1"),
                    summary_date: Some(date),
                })
                .unwrap();
        }

        backend.push_json(json!({"summary": {
            "headline": "the week", "key_points": ["momentum"]
        }}));
        let opts = StageOptions {
            // Monday of that week; no daily work requested.
            date: NaiveDate::from_ymd_opt(2024, 6, 10),
            week: NaiveDate::from_ymd_opt(2024, 6, 10),
            ..StageOptions::default()
        };
        let report = summarize::run(&ctx, &opts).await.unwrap();
        assert_eq!(report.written, 1);

        let row = ctx
            .db
            .get_processing(EntityKind::WeeklySummary, "g1:week:2024-06-10", Stage::Summarize)
            .unwrap()
            .expect("weekly row");
        assert_eq!(row.result["summary"]["headline"], json!("the week"));
    }

    #[tokio::test]
    async fn test_extract_writes_typed_rows() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1", "m2"]);
        mark_kept(&db, &["m1", "m2"]);

        let backend = Arc::new(StubBackend::new());
        // Quote pass finds one; announcement and faq find nothing.
        backend.push_json(json!({"extracts": [{
            "id": "q1", "source_message_id": "m1", "type": "quote",
            "content": "best tool ever", "relevance_score": 0.9
        }]}));
        backend.push_json(json!({"extracts": []}));
        backend.push_json(json!({"extracts": []}));

        let ctx = ctx_with(db, backend.clone());
        let report = extract::run(&ctx, &StageOptions::default()).await.unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.extract_types.get("quote"), Some(&1));
        assert_eq!(backend.calls(), 3);

        let by_type = ctx.db.extracts_by_type().unwrap();
        assert_eq!(by_type, vec![("quote".to_string(), 1)]);

        // Quote defaults: positive sentiment, permission required.
        let pending = ctx.db.unformatted_extracts(10).unwrap();
        assert_eq!(pending[0].sentiment, "positive");
        assert!(pending[0].requires_permission);
        assert_eq!(pending[0].source_id, "m1");
    }

    #[tokio::test]
    async fn test_extract_kind_errors_are_isolated() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1"]);
        mark_kept(&db, &["m1"]);

        let backend = Arc::new(StubBackend::new());
        backend.push_error(crate::ai::AiError::status(400, "bad request"));
        backend.push_json(json!({"extracts": [{
            "id": "a1", "source_message_id": "m1", "type": "announcement",
            "content": "v2 is out"
        }]}));
        backend.push_json(json!({"extracts": []}));

        let ctx = ctx_with(db, backend.clone());
        let report = extract::run(&ctx, &StageOptions::default()).await.unwrap();

        // Quote pass failed, the others still ran.
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.written, 1);
        assert_eq!(report.extract_types.get("announcement"), Some(&1));
    }

    #[tokio::test]
    async fn test_format_fills_unformatted_extracts() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1"]);
        let topics = json!([]);
        let row_id = db
            .insert_extract(&crate::db::ExtractWrite {
                source_type: "message",
                source_id: "m1",
                extract_type: "quote",
                title: None,
                content: "love it",
                relevance_score: 0.8,
                sentiment: "positive",
                topics: &topics,
                requires_permission: true,
            })
            .unwrap();

        let backend = Arc::new(StubBackend::new());
        backend.push_json(json!({"formatted": [
            {"id": row_id, "formatted_content": "“love it” — community member"}
        ]}));
        let ctx = ctx_with(db, backend.clone());

        let report = format::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(report.written, 1);
        assert!(ctx.db.unformatted_extracts(10).unwrap().is_empty());

        // Nothing left: the next run is a no-op.
        let report = format::run(&ctx, &StageOptions::default()).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_calls() {
        let db = test_fixtures::seeded();
        seed_messages(&db, &["m1", "m2"]);

        let backend = Arc::new(StubBackend::new());
        let ctx = ctx_with(db, backend.clone());

        let opts = StageOptions {
            dry_run: true,
            ..StageOptions::default()
        };
        let report = filter::run(&ctx, &opts).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.candidates, 2);
        assert_eq!(report.batches, 1);
        assert_eq!(backend.calls(), 0);
        assert_eq!(ctx.db.processing_status().unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn test_run_all_respects_stage_toggles() {
        let db = test_fixtures::seeded();
        let backend = Arc::new(StubBackend::new());
        let mut ctx = ctx_with(db, backend.clone());
        ctx.config.ai.stages.insert(
            "extract".to_string(),
            crate::config::StageToggle { enabled: false },
        );

        // Empty store: every enabled stage reports zero candidates.
        let reports = run_all(&ctx, &StageOptions::default()).await.unwrap();
        let names: Vec<&str> = reports.iter().map(|r| r.stage).collect();
        assert_eq!(names, vec!["filter", "categorize", "summarize", "format"]);
        assert_eq!(backend.calls(), 0);
    }
}
