//! guildpress: scrape a Discord guild into SQLite and distill the
//! chatter into marketing artifacts with a staged LLM pipeline.
//!
//! The flow is scrape → filter → categorize → summarize → extract →
//! format. Raw entities and per-stage results live in one embedded
//! store keyed so every step is safe to re-run.

pub mod ai;
pub mod config;
pub mod db;
pub mod discord;
pub mod export;
pub mod scraper;
pub mod stages;
