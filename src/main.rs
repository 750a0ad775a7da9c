use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use guildpress::ai::{LlmDriver, PromptStore};
use guildpress::config::{Config, LoggingConfig};
use guildpress::db::{Database, Stage};
use guildpress::discord::DiscordGateway;
use guildpress::export::{self, ExportFormat, ExportOptions};
use guildpress::scraper::{run_scrape, ScrapeMode, ScrapeOptions};
use guildpress::stages::{run_all, run_stage, StageContext, StageOptions};

#[derive(Parser)]
#[command(name = "guildpress")]
#[command(about = "Discord guild scraping and LLM marketing pipeline")]
#[command(version)]
struct Cli {
    /// Config file path (default: ./config.json when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch guild messages into the store
    Scrape {
        /// Re-walk full channel histories
        #[arg(long, conflicts_with = "incremental")]
        full: bool,
        /// Resume from each channel's cursor (default)
        #[arg(long)]
        incremental: bool,
        /// Only scrape channels with these names (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,
        /// Per-channel message cap
        #[arg(long)]
        limit: Option<usize>,
        /// Milliseconds between page requests
        #[arg(long)]
        delay: Option<u64>,
        /// Enumerate and count without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Store maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Export stored data as JSON or CSV
    Export {
        #[command(subcommand)]
        target: ExportTarget,
    },

    /// Run or inspect the LLM pipeline
    Process {
        #[command(subcommand)]
        command: ProcessCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Create the database and apply migrations
    Init,
    /// Table counts, message time range, file size
    Stats,
    /// Print the configured database path
    Path,
}

#[derive(Subcommand)]
enum ExportTarget {
    Messages {
        #[command(flatten)]
        args: ExportArgs,
    },
    Channels {
        #[command(flatten)]
        args: ExportArgs,
    },
    Summary {
        #[command(flatten)]
        args: ExportArgs,
    },
}

#[derive(Args)]
struct ExportArgs {
    #[arg(long, default_value = "json")]
    format: String,
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    until: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    include_embeds: bool,
    #[arg(long)]
    include_attachments: bool,
    #[arg(long)]
    include_reactions: bool,
    #[arg(long)]
    pretty: bool,
    /// Write here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ProcessCommands {
    /// Run one stage or the whole registry
    Run {
        /// filter | categorize | summarize | extract | format
        #[arg(long, conflicts_with = "all")]
        stage: Option<String>,
        /// Run every enabled stage in order
        #[arg(long)]
        all: bool,
        /// Restrict to one channel id
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Reprocess entities that already have results
        #[arg(long)]
        force: bool,
        /// Plan batches without calling the LLM
        #[arg(long)]
        dry_run: bool,
        /// Day for daily summaries (YYYY-MM-DD, default yesterday)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Week start (Monday) enabling the weekly rollup
        #[arg(long)]
        week: Option<NaiveDate>,
    },
    /// Memoized row counts per stage
    Status,
    /// Drop one stage's results so it runs fresh
    Reset {
        stage: String,
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Scrape {
            full,
            incremental: _,
            channels,
            limit,
            delay,
            dry_run,
        } => {
            let (token, guild_id) = config.require_discord()?;
            let db = Database::open(&config.database.path)?;
            let gateway = DiscordGateway::connect(token).await?;

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("ctrl-c received; stopping after the current page");
                        cancel.store(true, Ordering::Relaxed);
                    }
                });
            }

            let opts = ScrapeOptions {
                mode: if full { ScrapeMode::Full } else { ScrapeMode::Incremental },
                channel_names: channels,
                limit,
                delay_ms: delay.unwrap_or(config.scraper.delay_between_requests),
                dry_run,
            };
            let outcome = run_scrape(&db, &gateway, guild_id, &opts, &cancel).await?;
            println!(
                "scraped {} channels ({} failed), {} messages{}",
                outcome.channels_scraped,
                outcome.channels_failed,
                outcome.messages_saved,
                if dry_run { " [dry run]" } else { "" },
            );
        }

        Commands::Db { command } => match command {
            DbCommands::Init => {
                let db = Database::open(&config.database.path)?;
                println!("database ready at {}", db.path().unwrap().display());
            }
            DbCommands::Stats => {
                let db = Database::open(&config.database.path)?;
                println!("{}", serde_json::to_string_pretty(&db.stats()?)?);
            }
            DbCommands::Path => {
                println!("{}", config.database.path.display());
            }
        },

        Commands::Export { target } => {
            let db = Database::open(&config.database.path)?;
            let (args, rendered) = match target {
                ExportTarget::Messages { args } => {
                    let format: ExportFormat = args.format.parse()?;
                    let opts = ExportOptions {
                        since: args.since.clone(),
                        until: args.until.clone(),
                        limit: args.limit,
                        include_embeds: args.include_embeds,
                        include_attachments: args.include_attachments,
                        include_reactions: args.include_reactions,
                        pretty: args.pretty,
                    };
                    let rendered = export::export_messages(&db, format, &opts)?;
                    (args, rendered)
                }
                ExportTarget::Channels { args } => {
                    let format: ExportFormat = args.format.parse()?;
                    let rendered = export::export_channels(&db, format, args.pretty)?;
                    (args, rendered)
                }
                ExportTarget::Summary { args } => {
                    let format: ExportFormat = args.format.parse()?;
                    let rendered = export::export_summaries(&db, format, args.limit, args.pretty)?;
                    (args, rendered)
                }
            };
            match &args.output {
                Some(path) => {
                    std::fs::write(path, rendered)?;
                    info!(path = %path.display(), "export written");
                }
                None => println!("{rendered}"),
            }
        }

        Commands::Process { command } => match command {
            ProcessCommands::Run {
                stage,
                all,
                channel,
                since,
                until,
                limit,
                force,
                dry_run,
                date,
                week,
            } => {
                if stage.is_none() && !all {
                    anyhow::bail!("pass --stage <name> or --all");
                }
                config.require_ai_key()?;

                let db = Database::open(&config.database.path)?;
                let driver =
                    LlmDriver::from_config(&config.ai, config.scraper.backoff_multiplier)?;
                let prompts = PromptStore::new(config.prompts.dir.clone());
                let ctx = StageContext::new(db, driver, prompts, config.clone());

                let opts = StageOptions {
                    channel_id: channel,
                    since,
                    until,
                    limit,
                    force,
                    dry_run,
                    date,
                    week,
                };
                let reports = match stage {
                    Some(name) => {
                        let stage: Stage = name.parse()?;
                        vec![run_stage(&ctx, stage, &opts).await?]
                    }
                    None => run_all(&ctx, &opts).await?,
                };
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
            ProcessCommands::Status => {
                let db = Database::open(&config.database.path)?;
                let status = db.processing_status()?;
                if status.is_empty() {
                    println!("no stage results yet");
                } else {
                    for (stage, count) in status {
                        println!("{stage:12} {count}");
                    }
                }
                for (extract_type, count) in db.extracts_by_type()? {
                    println!("extract/{extract_type:10} {count}");
                }
            }
            ProcessCommands::Reset { stage, confirm } => {
                let stage: Stage = stage.parse()?;
                if !confirm {
                    anyhow::bail!(
                        "resetting drops every {stage} result; re-run with --confirm"
                    );
                }
                let db = Database::open(&config.database.path)?;
                let removed = db.reset_stage(stage)?;
                println!("removed {removed} {stage} rows");
            }
        },
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let default_directives = format!(
        "guildpress={level},serenity=info,reqwest=info,hyper=warn,rustls=warn",
        level = logging.level
    );
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
