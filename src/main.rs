use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{RateLimiter, RulesConfig};
use tollgate::store::open_store;

/// Inspect and manage fixed-window rate limit counters.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// YAML rules file; replaces the rules from the configuration
    #[arg(short, long, global = true)]
    rules: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count units against a key and print each decision
    Check {
        key: String,
        /// Limit per window; uses the matching configured rule when omitted
        #[arg(long, requires = "window_secs", allow_negative_numbers = true)]
        limit: Option<i64>,
        /// Window length in seconds
        #[arg(long, requires = "limit")]
        window_secs: Option<u64>,
        /// Number of units to count
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Show the live window for a key without counting
    Get { key: String },
    /// Clear the window for a key
    Reset { key: String },
    /// Clear every window whose key matches a glob pattern
    ResetAll { pattern: String },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tollgate");

    let config = TollgateConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(backend = ?config.store.backend(), rules = config.rules.len(), "Configuration loaded");

    let rules = match cli.rules.as_deref() {
        Some(path) => RulesConfig::from_file(path).context("loading rules file")?,
        None => RulesConfig::from_rules(config.rules.clone()),
    };

    let backend = config.store.backend();
    if !backend.is_shared() && !matches!(cli.command, Command::Check { .. }) {
        warn!(
            ?backend,
            "In-process counters exist only for this run; set REDIS_URL to inspect shared counters"
        );
    }

    let store = open_store(&config.store).await.context("opening counter store")?;
    let limiter = RateLimiter::with_rules(store, rules);

    let outcome = run(&limiter, cli.command).await;
    limiter.close().await?;
    outcome
}

async fn run(limiter: &RateLimiter, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Check {
            key,
            limit,
            window_secs,
            times,
        } => {
            for _ in 0..times {
                let decision = match (limit, window_secs) {
                    (Some(limit), Some(secs)) => {
                        limiter
                            .check_with(&key, limit, Duration::from_secs(secs))
                            .await?
                    }
                    _ => limiter.check(&key).await?,
                };
                println!(
                    "allowed={} remaining={} limit={} reset_at={} retry_after_ms={}",
                    decision.allowed,
                    decision.remaining,
                    decision.limit,
                    decision.reset_at.to_rfc3339(),
                    decision.retry_after(Utc::now()).as_millis()
                );
            }
        }
        Command::Get { key } => {
            let state = limiter.peek(&key).await?;
            match state.expires_at {
                Some(expires_at) => {
                    println!("count={} expires_at={}", state.count, expires_at.to_rfc3339())
                }
                None => println!("count={} expires_at=-", state.count),
            }
        }
        Command::Reset { key } => {
            limiter.reset(&key).await?;
            println!("reset {}", key);
        }
        Command::ResetAll { pattern } => {
            limiter.reset_all(&pattern).await?;
            println!("reset keys matching {}", pattern);
        }
    }
    Ok(())
}
