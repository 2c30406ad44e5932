//! Influencer list loading and per-run rotation.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

static PROFILE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:https?://)?(?:www\.)?(?:twitter\.com|x\.com)/([A-Za-z0-9_]+)").unwrap()
});
static BARE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z0-9_]+)$").unwrap());

/// Path segments on x.com that are not profiles.
const RESERVED: &[&str] = &["i", "intent", "share", "search", "hashtag"];

/// Source of the raw influencer sheet contents (CSV text).
#[async_trait]
pub trait InfluencerSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Published CSV export of a spreadsheet.
#[derive(Debug, Clone)]
pub struct SheetCsvSource {
    http: Client,
    url: String,
}

impl SheetCsvSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("tg-relaybot/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl InfluencerSource for SheetCsvSource {
    async fn fetch(&self) -> Result<String> {
        debug!(url = %self.url, "fetching influencer sheet");
        let res = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("failed to reach influencer sheet")?;
        if !res.status().is_success() {
            return Err(anyhow!("influencer sheet error {}", res.status()));
        }
        res.text().await.context("failed to read influencer sheet")
    }
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl InfluencerSource for FileSource {
    async fn fetch(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))
    }
}

/// The configured source, URL first. `None` when neither is set.
pub fn source_from_config(cfg: &Config) -> Result<Option<Box<dyn InfluencerSource>>> {
    if let Some(url) = cfg.influencers.sheet_csv_url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Ok(Some(Box::new(SheetCsvSource::new(url)?)));
    }
    if let Some(path) = cfg.influencers.file.as_deref().filter(|p| !p.trim().is_empty()) {
        return Ok(Some(Box::new(FileSource::new(path))));
    }
    Ok(None)
}

/// Pull a handle out of `@name`, a profile URL or a bare name.
pub fn extract_username(value: &str) -> Option<String> {
    let value = value.trim();
    if let Some(name) = value.strip_prefix('@') {
        return (!name.is_empty()).then(|| name.to_string());
    }

    let caps = PROFILE_URL_RE
        .captures(value)
        .or_else(|| BARE_NAME_RE.captures(value))?;
    let name = caps.get(1)?.as_str();
    if RESERVED.contains(&name.to_lowercase().as_str()) {
        return None;
    }
    Some(name.to_string())
}

/// Lowercased, de-duplicated handles from the first column, header skipped.
pub fn parse_sheet(csv: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    csv.lines()
        .skip(1)
        .map(first_field)
        .filter(|v| !v.trim().is_empty())
        .filter_map(|v| extract_username(&v))
        .map(|u| u.to_lowercase())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

/// First CSV field of a line, honouring double quotes.
fn first_field(line: &str) -> String {
    let line = line.trim_end_matches('\r');
    let Some(rest) = line.strip_prefix('"') else {
        return line.split(',').next().unwrap_or_default().to_string();
    };
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                out.push('"');
                chars.next();
            } else {
                break;
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Indices checked this run and the offset for the next one.
///
/// Walks `size` entries from `offset`, wrapping around, never repeating an
/// index within one run.
pub fn rotation_window(total: usize, offset: usize, size: usize) -> (Vec<usize>, usize) {
    if total == 0 || size == 0 {
        return (Vec::new(), 0);
    }
    let start = offset % total;
    let take = size.min(total);
    let indices = (0..take).map(|i| (start + i) % total).collect();
    (indices, (start + take) % total)
}
