use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::Tweet;

pub mod model;

pub use model::{ApiTweet, TwitterUser};
use model::{TweetsResp, UsersResp};

/// The users lookup endpoint accepts at most this many names per call.
pub const LOOKUP_CHUNK: usize = 100;

#[derive(Debug, Error)]
pub enum TwitterError {
    #[error("no bearer tokens configured")]
    NoTokens,
    #[error("rate limited")]
    RateLimited,
    #[error("unauthorized ({0})")]
    Unauthorized(StatusCode),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("twitter api error {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("all tokens failed: {0}")]
    AllTokensFailed(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TwitterError {
    /// Whether another token might succeed where this one failed.
    fn rotates(&self) -> bool {
        match self {
            TwitterError::RateLimited
            | TwitterError::Unauthorized(_)
            | TwitterError::Transport(_) => true,
            TwitterError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Raw X API v2 surface. The token is passed per call so rotation stays
/// outside the HTTP layer.
#[async_trait]
pub trait TwitterApi: Send + Sync {
    async fn lookup_users(
        &self,
        token: &str,
        usernames: &[String],
    ) -> Result<Vec<TwitterUser>, TwitterError>;

    async fn user_tweets(
        &self,
        token: &str,
        user_id: &str,
        since_id: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<ApiTweet>, TwitterError>;
}

#[derive(Clone)]
pub struct HttpTwitterApi {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for HttpTwitterApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTwitterApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpTwitterApi {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("invalid twitter api base url")?;
        let http = Client::builder()
            .user_agent("tg-relaybot/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base_url })
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &str, url: Url) -> Result<T, TwitterError> {
        debug!(url = %url.path(), "twitter api request");
        let res = self.http.get(url).bearer_auth(token).send().await?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TwitterError::RateLimited);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TwitterError::Unauthorized(status));
        }
        if status == StatusCode::NOT_FOUND {
            let body = res.text().await.unwrap_or_default();
            return Err(TwitterError::NotFound(body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(TwitterError::Status { status, body });
        }
        let body = res.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl TwitterApi for HttpTwitterApi {
    async fn lookup_users(
        &self,
        token: &str,
        usernames: &[String],
    ) -> Result<Vec<TwitterUser>, TwitterError> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self
            .base_url
            .join("users/by")
            .context("invalid users lookup url")?;
        url.query_pairs_mut()
            .append_pair("usernames", &usernames.join(","))
            .append_pair("user.fields", "id,username");
        let resp: UsersResp = self.get_json(token, url).await?;
        if let Some(errors) = resp.errors.as_ref().filter(|e| !e.is_empty()) {
            debug!(count = errors.len(), "users lookup reported unresolved names");
        }
        Ok(resp.data.unwrap_or_default())
    }

    async fn user_tweets(
        &self,
        token: &str,
        user_id: &str,
        since_id: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<ApiTweet>, TwitterError> {
        let mut url = self
            .base_url
            .join(&format!("users/{}/tweets", user_id))
            .context("invalid user timeline url")?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("max_results", &max_results.to_string());
            q.append_pair("tweet.fields", "created_at,text");
            if let Some(since) = since_id {
                q.append_pair("since_id", since);
            }
        }
        let resp: TweetsResp = self.get_json(token, url).await?;
        Ok(resp.data.unwrap_or_default())
    }
}

/// Token-rotating client backed by the relay's state store.
///
/// Each call starts at the last token that succeeded. Rate-limited,
/// unauthorized and transport failures move on to the next token; tokens that
/// already spent their monthly budget are skipped.
pub struct TwitterClient {
    api: Arc<dyn TwitterApi>,
    tokens: Vec<String>,
    pool: Pool,
    monthly_limit: u32,
    max_results: u32,
}

impl TwitterClient {
    pub fn new(
        api: Arc<dyn TwitterApi>,
        tokens: Vec<String>,
        pool: Pool,
        monthly_limit: u32,
        max_results: u32,
    ) -> Self {
        Self {
            api,
            tokens,
            pool,
            monthly_limit,
            max_results,
        }
    }

    pub fn from_config(cfg: &Config, pool: Pool) -> anyhow::Result<Self> {
        let api = HttpTwitterApi::new(&cfg.twitter.api_base)?;
        Ok(Self::new(
            Arc::new(api),
            cfg.twitter.bearer_tokens.clone(),
            pool,
            cfg.twitter.monthly_call_limit,
            cfg.twitter.max_results,
        ))
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    async fn with_rotation<T, F, Fut>(&self, op: F) -> Result<T, TwitterError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, TwitterError>>,
    {
        let n = self.tokens.len();
        if n == 0 {
            return Err(TwitterError::NoTokens);
        }
        let month = db::month_key(Utc::now());
        let start = db::current_token_index(&self.pool).await? % n;
        let mut failures = Vec::new();

        for step in 0..n {
            let idx = (start + step) % n;
            if self.monthly_limit > 0 {
                let used = db::token_calls(&self.pool, idx, &month).await?;
                if used >= i64::from(self.monthly_limit) {
                    debug!(token = idx + 1, used, "monthly budget exhausted; skipping token");
                    failures.push(format!("token {}: monthly budget exhausted", idx + 1));
                    continue;
                }
            }

            match op(self.tokens[idx].clone()).await {
                Ok(value) => {
                    db::record_token_call(&self.pool, idx, &month).await?;
                    db::set_current_token_index(&self.pool, idx).await?;
                    info!(token = idx + 1, "twitter call succeeded");
                    return Ok(value);
                }
                Err(err) if err.rotates() => {
                    warn!(token = idx + 1, %err, "twitter call failed; trying next token");
                    failures.push(format!("token {}: {}", idx + 1, err));
                }
                Err(err) => {
                    // The request reached the API, so it still costs budget.
                    db::record_token_call(&self.pool, idx, &month).await?;
                    return Err(err);
                }
            }
        }

        error!(?failures, "all twitter tokens failed");
        Err(TwitterError::AllTokensFailed(failures.join("; ")))
    }

    /// Resolve and cache ids for every name without one. Returns how many
    /// ids were newly cached.
    pub async fn cache_user_ids(&self, usernames: &[String]) -> Result<usize, TwitterError> {
        let uncached = db::uncached_usernames(&self.pool, usernames).await?;
        if uncached.is_empty() {
            info!("all influencer user ids already cached");
            return Ok(0);
        }
        info!(count = uncached.len(), "caching twitter user ids");

        let mut cached = 0;
        for (i, chunk) in uncached.chunks(LOOKUP_CHUNK).enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let users = self.lookup_chunk(chunk).await?;
            let entries: Vec<(String, String)> = users
                .into_iter()
                .map(|u| (u.username.to_lowercase(), u.id))
                .collect();
            db::cache_user_ids(&self.pool, &entries).await?;
            cached += entries.len();
            info!(batch = i + 1, cached = entries.len(), "cached user ids");
        }
        Ok(cached)
    }

    async fn lookup_chunk(&self, chunk: &[String]) -> Result<Vec<TwitterUser>, TwitterError> {
        let api = self.api.as_ref();
        self.with_rotation(move |token| async move { api.lookup_users(&token, chunk).await })
            .await
    }

    /// Cached user id for `username`, looked up on a miss.
    pub async fn user_id(&self, username: &str) -> Result<String, TwitterError> {
        if let Some(id) = db::cached_user_id(&self.pool, username).await? {
            return Ok(id);
        }
        let wanted = [username.to_string()];
        let users = self.lookup_chunk(&wanted).await?;
        let user = users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .ok_or_else(|| TwitterError::NotFound(format!("user {}", username)))?;
        db::cache_user_ids(&self.pool, &[(username.to_lowercase(), user.id.clone())]).await?;
        Ok(user.id)
    }

    /// Recent tweets of `username` newer than `since_id`, newest first.
    pub async fn recent_tweets(
        &self,
        username: &str,
        since_id: Option<&str>,
    ) -> Result<Vec<Tweet>, TwitterError> {
        let user_id = self.user_id(username).await?;
        let api = self.api.as_ref();
        let uid = user_id.as_str();
        let max = self.max_results;
        let mut tweets = self
            .with_rotation(move |token| async move {
                api.user_tweets(&token, uid, since_id, max).await
            })
            .await?;
        tweets.sort_by(|a, b| compare_ids(&b.id, &a.id));
        Ok(tweets
            .into_iter()
            .map(|t| Tweet {
                id: t.id,
                text: t.text,
                username: username.to_string(),
                created_at: t.created_at,
            })
            .collect())
    }
}

/// Orders numeric snowflake ids without parsing them.
pub fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
