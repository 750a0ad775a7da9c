//! Per-stage validation of model output. The schemas are the Rust
//! types: serde decoding rejects missing or mistyped fields, and the
//! range checks below cover what types alone cannot. Stage payloads
//! are persisted only after passing here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("response shape invalid: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("{field} out of range: {value}")]
    Range { field: &'static str, value: f64 },
}

fn check_unit_interval(field: &'static str, value: f64) -> Result<(), SchemaError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SchemaError::Range { field, value });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
            Sentiment::Mixed => "mixed",
        }
    }
}

/// Urgency and marketing relevance share the same closed scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDecision {
    pub id: String,
    pub keep: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterResponse {
    pub decisions: Vec<FilterDecision>,
}

pub fn filter_response(value: &Value) -> Result<FilterResponse, SchemaError> {
    let parsed: FilterResponse = serde_json::from_value(value.clone())?;
    for decision in &parsed.decisions {
        if let Some(score) = decision.quality_score {
            check_unit_interval("quality_score", score)?;
        }
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Categorization {
    pub id: String,
    pub primary_topic: String,
    #[serde(default)]
    pub secondary_topics: Vec<String>,
    pub sentiment: Sentiment,
    pub urgency: Tier,
    pub marketing_relevance: Tier,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategorizeResponse {
    pub categorizations: Vec<Categorization>,
}

pub fn categorize_response(value: &Value) -> Result<CategorizeResponse, SchemaError> {
    Ok(serde_json::from_value(value.clone())?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub headline: String,
    pub key_points: Vec<String>,
    #[serde(default)]
    pub notable_messages: Vec<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_overview: Option<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeResponse {
    pub summary: SummaryPayload,
}

pub fn summarize_response(value: &Value) -> Result<SummarizeResponse, SchemaError> {
    Ok(serde_json::from_value(value.clone())?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractItem {
    pub id: String,
    #[serde(default)]
    pub source_message_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub relevance_score: Option<f64>,
    #[serde(default)]
    pub requires_permission: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractResponse {
    pub extracts: Vec<ExtractItem>,
}

pub fn extract_response(value: &Value) -> Result<ExtractResponse, SchemaError> {
    let parsed: ExtractResponse = serde_json::from_value(value.clone())?;
    for item in &parsed.extracts {
        if let Some(score) = item.relevance_score {
            check_unit_interval("relevance_score", score)?;
        }
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatItem {
    /// Extract row id; models sometimes echo it back as a string.
    pub id: Value,
    pub formatted_content: String,
}

impl FormatItem {
    pub fn row_id(&self) -> Option<i64> {
        match &self.id {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatResponse {
    pub formatted: Vec<FormatItem>,
}

pub fn format_response(value: &Value) -> Result<FormatResponse, SchemaError> {
    Ok(serde_json::from_value(value.clone())?)
}
