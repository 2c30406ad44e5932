use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use teloxide::Bot;
use tracing::{error, info, warn};

use tg_relaybot::config;
use tg_relaybot::db;
use tg_relaybot::monitor::Monitor;
use tg_relaybot::outbox;
use tg_relaybot::scheduler::{self, Job};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run relay checks once, deliver what they enqueued, and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Jobs to run, in order (default: all)
    #[arg(long = "job", value_enum)]
    jobs: Vec<Job>,

    /// Only enqueue notifications; leave delivery to the running bot
    #[arg(long)]
    no_deliver: bool,
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

    let monitor = Monitor::from_config(&cfg, pool.clone())?;
    let jobs = if args.jobs.is_empty() {
        // Reload first so the influencer check sees a fresh list.
        vec![Job::Reload, Job::Official, Job::Medium, Job::Influencers]
    } else {
        args.jobs.clone()
    };

    let mut failed = 0;
    for job in jobs {
        match scheduler::run_job(&monitor, job).await {
            Ok(count) => info!(job = job.as_str(), count, "job finished"),
            Err(err) => {
                failed += 1;
                error!(?err, job = job.as_str(), "job failed");
            }
        }
    }

    if args.no_deliver {
        let pending = db::count_remaining_outbox_tasks(&pool).await?;
        info!(pending, "delivery skipped");
    } else {
        let bot = Bot::new(cfg.telegram.bot_token.clone());
        let delivered = outbox::drain_due(
            &pool,
            &bot,
            cfg.app.max_backoff_seconds as i64,
            cfg.app.max_delivery_attempts,
        )
        .await?;
        let remaining = db::count_remaining_outbox_tasks(&pool).await?;
        if remaining > 0 {
            warn!(delivered, remaining, "some deliveries are in backoff; the bot will retry them");
        } else {
            info!(delivered, "all deliveries handled");
        }
    }

    if failed > 0 {
        anyhow::bail!("{} job(s) failed", failed);
    }
    Ok(())
}
