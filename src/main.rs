use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info, warn};

use tg_relaybot::config;
use tg_relaybot::db;
use tg_relaybot::monitor::Monitor;
use tg_relaybot::notify::Notifier;
use tg_relaybot::outbox;
use tg_relaybot::scheduler;
use tg_relaybot::telegram::{self, BotContext};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let bot = Bot::new(cfg.telegram.bot_token.clone());

    // Outbox worker (single-threaded)
    let worker_pool = pool.clone();
    let worker_bot = bot.clone();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    let max_attempts = cfg.app.max_delivery_attempts;
    let worker = tokio::spawn(async move {
        loop {
            match outbox::process_next_task(&worker_pool, &worker_bot, max_backoff, max_attempts)
                .await
            {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "outbox worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let monitor = Arc::new(Monitor::from_config(&cfg, pool.clone())?);
    log_startup(&cfg);
    if let Err(err) = monitor.reload_influencers().await {
        warn!(?err, "initial influencer load failed");
    }
    let mut handles = scheduler::spawn_all(monitor, &cfg.schedule);
    handles.push(worker);

    let ctx = Arc::new(BotContext {
        pool,
        notifier: Notifier::new(cfg.recipients.clone()),
        official_account: cfg.twitter.official_account.clone(),
        source_channel_id: cfg.telegram.source_channel_id.clone(),
    });

    info!("starting telegram bot");
    telegram::run(bot, ctx).await;

    info!("shutting down background tasks");
    for handle in &handles {
        handle.abort();
    }
    let _ = futures::future::join_all(handles).await;
    Ok(())
}

fn log_startup(cfg: &config::Config) {
    let names = |members: &[config::Member]| {
        members
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let s = &cfg.schedule;
    info!(
        tokens = cfg.twitter.bearer_tokens.len(),
        official = %cfg.twitter.official_account,
        medium = %cfg.medium.username,
        source_channel = ?cfg.telegram.source_channel_id,
        "relay configuration"
    );
    info!(
        count = cfg.recipients.team_members.len(),
        names = %names(&cfg.recipients.team_members),
        "team members"
    );
    info!(
        count = cfg.recipients.influencer_managers.len(),
        names = %names(&cfg.recipients.influencer_managers),
        "influencer managers"
    );
    info!(
        official_secs = s.official_check_secs,
        medium_secs = s.medium_check_secs,
        influencer_secs = s.influencer_check_secs,
        reload_secs = s.influencer_reload_secs,
        "schedule"
    );
    let budget = cfg.monthly_call_budget();
    let estimate = cfg.estimated_monthly_calls();
    if budget > 0 && estimate > budget {
        warn!(estimate, budget, "estimated twitter usage exceeds monthly budget");
    } else {
        info!(estimate, budget, "twitter api budget");
    }
}
