//! Fixed-interval job runner.
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::config::Schedule;
use crate::monitor::Monitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Job {
    /// Official X account
    Official,
    /// Medium publication
    Medium,
    /// Influencer batch
    Influencers,
    /// Influencer list reload
    Reload,
}

impl Job {
    pub const ALL: [Job; 4] = [Job::Official, Job::Medium, Job::Influencers, Job::Reload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::Official => "official_check",
            Job::Medium => "medium_check",
            Job::Influencers => "influencer_check",
            Job::Reload => "reload_influencers",
        }
    }

    pub fn interval(&self, schedule: &Schedule) -> Duration {
        match self {
            Job::Official => schedule.official_check(),
            Job::Medium => schedule.medium_check(),
            Job::Influencers => schedule.influencer_check(),
            Job::Reload => schedule.influencer_reload(),
        }
    }
}

/// Run one job to completion. Returns enqueued notifications, or loaded
/// names for `Reload`.
pub async fn run_job(monitor: &Monitor, job: Job) -> Result<usize> {
    match job {
        Job::Official => monitor.check_official().await,
        Job::Medium => monitor.check_medium().await,
        Job::Influencers => monitor.check_influencers().await,
        Job::Reload => monitor.reload_influencers().await,
    }
}

/// Spawn every job on its own interval. The first run of each happens one
/// period after startup; a job never overlaps with itself.
pub fn spawn_all(monitor: Arc<Monitor>, schedule: &Schedule) -> Vec<JoinHandle<()>> {
    Job::ALL
        .iter()
        .map(|job| spawn_job(monitor.clone(), *job, job.interval(schedule)))
        .collect()
}

pub fn spawn_job(monitor: Arc<Monitor>, job: Job, period: Duration) -> JoinHandle<()> {
    info!(job = job.as_str(), every_secs = period.as_secs(), "scheduling job");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            info!(job = job.as_str(), "job started");
            match run_job(&monitor, job).await {
                Ok(count) => info!(job = job.as_str(), count, "job finished"),
                Err(err) => error!(?err, job = job.as_str(), "job failed"),
            }
        }
    })
}
