use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use wallet_push::config::{self, Config};
use wallet_push::db::{self, Pool};
use wallet_push::dispatch::BatchDispatcher;
use wallet_push::error::PushError;
use wallet_push::lifecycle::{AudienceThreshold, PushLifecycle, PushReport};
use wallet_push::senders::{AppleSender, ApnsWakeUp, GoogleSender, GoogleWalletHttp};
use wallet_push::sweep::Sweeper;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduled/queued delivery loop until Ctrl-C
    Worker,
    /// Create a pending push request
    Submit {
        #[arg(long)]
        campaign: i64,
        #[arg(long)]
        message: String,
        /// RFC 3339 send time; omit to send on approval
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Approve a pending request
    Approve { id: i64 },
    /// Reject a pending request
    Reject {
        id: i64,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Send a scheduled or approved request immediately
    SendNow { id: i64 },
    /// Replace the text of a pending request
    Edit {
        id: i64,
        #[arg(long)]
        message: String,
    },
    /// Run one tick: recover stale, send due scheduled and queued requests
    Sweep {
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let lifecycle = Arc::new(build_lifecycle(&cfg, pool)?);

    match args.command {
        Command::Worker => run_worker(&cfg, lifecycle).await,
        Command::Submit {
            campaign,
            message,
            at,
        } => print_outcome(lifecycle.submit(campaign, &message, at).await),
        Command::Approve { id } => print_outcome(lifecycle.approve(id).await),
        Command::Reject { id, reason } => print_outcome(lifecycle.reject(id, &reason).await),
        Command::SendNow { id } => print_outcome(lifecycle.send_now(id).await),
        Command::Edit { id, message } => print_outcome(lifecycle.edit(id, &message).await),
        Command::Sweep { limit } => {
            let sweeper = Sweeper::new(lifecycle);
            let limit = limit.unwrap_or(cfg.app.sweep_limit);
            let summary = sweeper.tick(Utc::now(), limit, cfg.app.stale_after()).await?;
            println!(
                "{}",
                json!({
                    "recovered": summary.recovered,
                    "scheduled": summary.scheduled,
                    "queued": summary.queued,
                })
            );
            Ok(())
        }
    }
}

fn build_lifecycle(cfg: &Config, pool: Pool) -> Result<PushLifecycle> {
    let wake_up = Arc::new(ApnsWakeUp::from_config(cfg, pool.clone())?);
    let apple = Arc::new(AppleSender::new(pool.clone(), wake_up));
    let wallet = Arc::new(GoogleWalletHttp::from_config(cfg)?);
    let google = Arc::new(GoogleSender::new(wallet, cfg.google.issuer_id.clone()));
    let sizing = Arc::new(AudienceThreshold::new(pool.clone(), cfg.app.queue_threshold));
    let dispatcher = BatchDispatcher::new(cfg.dispatch.clone(), cfg.app.send_timeout());
    Ok(PushLifecycle::new(pool, dispatcher, apple, google, sizing))
}

async fn run_worker(cfg: &Config, lifecycle: Arc<PushLifecycle>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    info!("starting push worker");
    let sweeper = Sweeper::new(lifecycle);
    sweeper
        .run_loop(
            cfg.app.poll_interval(),
            cfg.app.sweep_limit,
            cfg.app.stale_after(),
            shutdown_rx,
        )
        .await;
    Ok(())
}

fn print_outcome(result: Result<PushReport, PushError>) -> Result<()> {
    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            let body = json!({ "error": err.kind(), "message": err.to_string() });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Err(err.into())
        }
    }
}
