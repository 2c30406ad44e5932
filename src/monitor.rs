//! Pollers for the watched feeds.
//!
//! Every check reads the account's cursor, fetches what is newer, and then
//! writes the new cursor together with the resulting outbox rows in one
//! transaction, so a post is either fully enqueued or will be seen again.
use anyhow::Result;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::influencers::{self, InfluencerSource};
use crate::medium::{self, FeedSource, MediumFeed};
use crate::model::{influencer_cursor_key, Notification, Platform, Tweet, WatchedAccount};
use crate::notify::Notifier;
use crate::twitter::{compare_ids, TwitterClient, TwitterError};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub official: WatchedAccount,
    pub medium: WatchedAccount,
    pub batch_size: usize,
    pub request_delay: Duration,
    pub notify_on_first_run: bool,
}

impl MonitorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            official: WatchedAccount::new(
                Platform::Twitter,
                cfg.twitter.official_account.clone(),
                cfg.schedule.official_check(),
            ),
            medium: WatchedAccount::new(
                Platform::Medium,
                cfg.medium.username.clone(),
                cfg.schedule.medium_check(),
            ),
            batch_size: cfg.influencers.batch_size,
            request_delay: Duration::from_millis(cfg.influencers.request_delay_ms),
            notify_on_first_run: cfg.app.notify_on_first_run,
        }
    }
}

pub struct Monitor {
    pool: Pool,
    twitter: TwitterClient,
    feed: Box<dyn FeedSource>,
    influencer_source: Option<Box<dyn InfluencerSource>>,
    notifier: Notifier,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(
        pool: Pool,
        twitter: TwitterClient,
        feed: Box<dyn FeedSource>,
        influencer_source: Option<Box<dyn InfluencerSource>>,
        notifier: Notifier,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            pool,
            twitter,
            feed,
            influencer_source,
            notifier,
            settings,
        }
    }

    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self> {
        let twitter = TwitterClient::from_config(cfg, pool.clone())?;
        let feed = Box::new(MediumFeed::from_config(cfg)?);
        let source = influencers::source_from_config(cfg)?;
        Ok(Self::new(
            pool,
            twitter,
            feed,
            source,
            Notifier::new(cfg.recipients.clone()),
            MonitorSettings::from_config(cfg),
        ))
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// New posts on the official account. Space announcements are flagged.
    #[instrument(skip_all, fields(account = %self.settings.official.handle))]
    pub async fn check_official(&self) -> Result<usize> {
        let account = &self.settings.official;
        let key = account.cursor_key();
        let cursor = db::get_cursor(&self.pool, &key).await?;
        let since = cursor.as_ref().map(|c| c.last_seen_id.as_str());

        let tweets = fresh_tweets(self.twitter.recent_tweets(&account.handle, since).await?, since);
        let Some(newest) = tweets.first() else {
            debug!("no new posts");
            return Ok(0);
        };

        let notify = cursor.is_some() || self.settings.notify_on_first_run;
        let mut tx = self.pool.begin().await?;
        let mut enqueued = 0;
        if notify {
            for tweet in tweets.iter().rev() {
                let notification = if tweet.is_space() {
                    Notification::SpaceLive(tweet.clone())
                } else {
                    Notification::OfficialPost(tweet.clone())
                };
                self.notifier.enqueue_tx(&mut tx, &notification).await?;
                enqueued += 1;
            }
        } else {
            info!(newest = %newest.id, "first check; recording cursor only");
        }
        db::set_cursor_tx(&mut tx, &key, &newest.id).await?;
        tx.commit().await?;

        info!(found = tweets.len(), enqueued, "official account checked");
        Ok(enqueued)
    }

    /// New articles on the Medium publication.
    #[instrument(skip_all, fields(account = %self.settings.medium.handle))]
    pub async fn check_medium(&self) -> Result<usize> {
        let key = self.settings.medium.cursor_key();
        let xml = self.feed.fetch().await?;
        let entries = medium::parse_feed(&xml);
        let Some(newest) = entries.first() else {
            debug!("feed has no entries");
            return Ok(0);
        };

        let cursor = db::get_cursor(&self.pool, &key).await?;
        let fresh = medium::new_articles(&entries, cursor.as_ref().map(|c| c.last_seen_id.as_str()));
        if fresh.is_empty() {
            debug!("no new articles");
            return Ok(0);
        }

        let notify = cursor.is_some() || self.settings.notify_on_first_run;
        let mut tx = self.pool.begin().await?;
        let mut enqueued = 0;
        if notify {
            for article in fresh.iter().rev() {
                self.notifier
                    .enqueue_tx(&mut tx, &Notification::MediumArticle(article.clone()))
                    .await?;
                enqueued += 1;
            }
        } else {
            info!(newest = %newest.id, "first check; recording cursor only");
        }
        db::set_cursor_tx(&mut tx, &key, &newest.id).await?;
        tx.commit().await?;

        info!(found = fresh.len(), enqueued, "medium checked");
        Ok(enqueued)
    }

    /// Reload the influencer list and cache user ids for new names. An empty
    /// result keeps the previous list.
    #[instrument(skip_all)]
    pub async fn reload_influencers(&self) -> Result<usize> {
        let Some(source) = self.influencer_source.as_ref() else {
            warn!("no influencer source configured");
            return Ok(0);
        };
        let raw = source.fetch().await?;
        let names = influencers::parse_sheet(&raw);
        if names.is_empty() {
            warn!("influencer source yielded no usernames; keeping previous list");
            return Ok(0);
        }
        db::replace_influencers(&self.pool, &names).await?;
        info!(count = names.len(), "loaded influencers");

        match self.twitter.cache_user_ids(&names).await {
            Ok(cached) => info!(cached, "influencer user ids cached"),
            Err(err) => warn!(%err, "failed to cache influencer user ids"),
        }
        Ok(names.len())
    }

    /// Check the next window of influencers for posts mentioning the official
    /// account. Influencers without a cached user id are skipped.
    #[instrument(skip_all)]
    pub async fn check_influencers(&self) -> Result<usize> {
        let list = db::list_influencers(&self.pool).await?;
        if list.is_empty() {
            debug!("no influencers loaded");
            return Ok(0);
        }
        let offset = db::influencer_offset(&self.pool).await?;
        let (window, next_offset) =
            influencers::rotation_window(list.len(), offset, self.settings.batch_size);
        info!(checking = window.len(), total = list.len(), offset, "checking influencers");

        let mut enqueued = 0;
        let mut requested = false;
        for idx in window {
            let username = &list[idx];
            if db::cached_user_id(&self.pool, username).await?.is_none() {
                debug!(%username, "no cached user id; skipping");
                continue;
            }
            if requested && !self.settings.request_delay.is_zero() {
                tokio::time::sleep(self.settings.request_delay).await;
            }
            requested = true;

            match self.check_influencer(username).await {
                Ok(n) => enqueued += n,
                Err(err) if out_of_tokens(&err) => {
                    // Keep the offset so the same window is retried next run.
                    warn!(%err, "no usable twitter token; stopping influencer check");
                    return Ok(enqueued);
                }
                Err(err) => warn!(?err, %username, "failed to check influencer"),
            }
        }

        db::set_influencer_offset(&self.pool, next_offset).await?;
        if enqueued > 0 {
            info!(
                enqueued,
                official = %self.settings.official.handle,
                "influencer posts mentioning official account"
            );
        }
        Ok(enqueued)
    }

    async fn check_influencer(&self, username: &str) -> Result<usize> {
        let key = influencer_cursor_key(username);
        let cursor = db::get_cursor(&self.pool, &key).await?;
        let since = cursor.as_ref().map(|c| c.last_seen_id.as_str());

        let tweets = fresh_tweets(self.twitter.recent_tweets(username, since).await?, since);
        let Some(newest) = tweets.first() else {
            return Ok(0);
        };

        let notify = cursor.is_some() || self.settings.notify_on_first_run;
        let official = &self.settings.official.handle;
        let mut tx = self.pool.begin().await?;
        let mut enqueued = 0;
        if notify {
            for tweet in tweets.iter().rev().filter(|t| t.mentions(official)) {
                self.notifier
                    .enqueue_tx(&mut tx, &Notification::InfluencerPost(tweet.clone()))
                    .await?;
                enqueued += 1;
            }
        }
        db::set_cursor_tx(&mut tx, &key, &newest.id).await?;
        tx.commit().await?;
        Ok(enqueued)
    }
}

fn out_of_tokens(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TwitterError>(),
        Some(TwitterError::NoTokens | TwitterError::AllTokensFailed(_))
    )
}

/// Drop anything not strictly newer than `since`; keeps newest-first order.
pub fn fresh_tweets(tweets: Vec<Tweet>, since: Option<&str>) -> Vec<Tweet> {
    match since {
        None => tweets,
        Some(since) => tweets
            .into_iter()
            .filter(|t| compare_ids(&t.id, since) == Ordering::Greater)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tweet(id: &str) -> Tweet {
        Tweet {
            id: id.into(),
            text: String::new(),
            username: "u".into(),
            created_at: None,
        }
    }

    #[test]
    fn fresh_tweets_filters_old_ids() {
        let tweets = vec![tweet("120"), tweet("100"), tweet("99")];
        let ids: Vec<String> = fresh_tweets(tweets.clone(), Some("100"))
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["120"]);
        assert_eq!(fresh_tweets(tweets, None).len(), 3);
    }

    #[test]
    fn token_exhaustion_is_detected_through_anyhow() {
        let err = anyhow::Error::from(TwitterError::AllTokensFailed("x".into()));
        assert!(out_of_tokens(&err));
        let err = anyhow::Error::from(TwitterError::RateLimited);
        assert!(!out_of_tokens(&err));
        assert!(!out_of_tokens(&anyhow::anyhow!("db down")));
    }
}
