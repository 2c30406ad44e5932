//! Medium publication feed: fetching and RSS item extraction.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::model::Article;

/// Entries considered per check; older items are ignored.
pub const MAX_ENTRIES: usize = 5;
const SUMMARY_CHARS: usize = 200;

static ITEM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<item\b[^>]*>(.*?)</item>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static LINK_RE: Lazy<Regex> = Lazy::new(|| tag_re("link"));
static GUID_RE: Lazy<Regex> = Lazy::new(|| tag_re("guid"));
static TITLE_RE: Lazy<Regex> = Lazy::new(|| tag_re("title"));
static DESCRIPTION_RE: Lazy<Regex> = Lazy::new(|| tag_re("description"));
static PUB_DATE_RE: Lazy<Regex> = Lazy::new(|| tag_re("pubDate"));
static CDATA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^\s*<!\[CDATA\[(.*)\]\]>\s*$").unwrap());

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Raw RSS document.
    async fn fetch(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct MediumFeed {
    http: Client,
    feed_url: String,
}

impl MediumFeed {
    pub fn new(base_url: &str, username: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("tg-relaybot/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            feed_url: feed_url(base_url, username),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            &cfg.medium.base_url,
            &cfg.medium.username,
            Duration::from_secs(cfg.medium.request_timeout_secs),
        )
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }
}

pub fn feed_url(base_url: &str, username: &str) -> String {
    format!(
        "{}/feed/@{}",
        base_url.trim_end_matches('/'),
        username.trim_start_matches('@')
    )
}

#[async_trait]
impl FeedSource for MediumFeed {
    async fn fetch(&self) -> Result<String> {
        debug!(url = %self.feed_url, "fetching medium feed");
        let res = self
            .http
            .get(&self.feed_url)
            .send()
            .await
            .context("failed to reach Medium")?;
        if !res.status().is_success() {
            return Err(anyhow!("medium feed error {}", res.status()));
        }
        res.text().await.context("failed to read Medium feed")
    }
}

/// Extract feed items in document order.
pub fn parse_feed(xml: &str) -> Vec<Article> {
    ITEM_RE
        .captures_iter(xml)
        .map(|cap| {
            let item = &cap[1];
            let link = tag_text(item, &LINK_RE).unwrap_or_default();
            let id = tag_text(item, &GUID_RE)
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| link.clone());
            let title = tag_text(item, &TITLE_RE)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Untitled".to_string());
            let summary = tag_text(item, &DESCRIPTION_RE)
                .map(|d| summarize(&d))
                .unwrap_or_default();
            let published = tag_text(item, &PUB_DATE_RE).unwrap_or_default();
            Article {
                id,
                title,
                link,
                summary,
                published,
            }
        })
        .collect()
}

/// Articles newer than `last_seen_id`, newest first, bounded by `MAX_ENTRIES`.
pub fn new_articles(entries: &[Article], last_seen_id: Option<&str>) -> Vec<Article> {
    entries
        .iter()
        .take(MAX_ENTRIES)
        .take_while(|a| Some(a.id.as_str()) != last_seen_id)
        .cloned()
        .collect()
}

fn tag_re(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}\b[^>]*>(.*?)</{tag}>")).unwrap()
}

fn tag_text(item: &str, re: &Regex) -> Option<String> {
    let raw = re.captures(item)?.get(1)?.as_str();
    let inner = match CDATA_RE.captures(raw) {
        Some(c) => c.get(1).map_or("", |m| m.as_str()).to_string(),
        None => unescape(raw),
    };
    Some(inner.trim().to_string())
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn summarize(description: &str) -> String {
    let plain = TAG_RE.replace_all(description, " ");
    let plain = plain.split_whitespace().collect::<Vec<_>>().join(" ");
    if plain.is_empty() {
        return String::new();
    }
    let cut: String = plain.chars().take(SUMMARY_CHARS).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
<title><![CDATA[Stories by Example on Medium]]></title>
<item>
  <title><![CDATA[Season two is here]]></title>
  <link>https://medium.com/@pub/season-two-abc</link>
  <guid isPermaLink="false">https://medium.com/p/abc</guid>
  <pubDate>Tue, 13 Oct 2026 10:00:00 GMT</pubDate>
  <description><![CDATA[<p>Big <b>news</b> for everyone.</p>]]></description>
</item>
<item>
  <title>Tom &amp; Jerry</title>
  <link>https://medium.com/@pub/tom-def</link>
  <guid isPermaLink="false">https://medium.com/p/def</guid>
</item>
<item>
  <link>https://medium.com/@pub/untitled-ghi</link>
</item>
</channel></rss>"#;

    #[test]
    fn parses_items_in_order() {
        let items = parse_feed(FEED);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].id, "https://medium.com/p/abc");
        assert_eq!(items[0].title, "Season two is here");
        assert_eq!(items[0].summary, "Big news for everyone....");
        assert_eq!(items[0].published, "Tue, 13 Oct 2026 10:00:00 GMT");
        assert_eq!(items[1].title, "Tom & Jerry");
        assert_eq!(items[1].summary, "");
        // guid missing: link doubles as id
        assert_eq!(items[2].id, "https://medium.com/@pub/untitled-ghi");
        assert_eq!(items[2].title, "Untitled");
    }

    #[test]
    fn tag_patterns_match_whole_names() {
        let xml = "<item><titles>no</titles><title>yes</title>\
                   <linkage>https://a</linkage><link>https://b</link></item>";
        let items = parse_feed(xml);
        assert_eq!(items[0].title, "yes");
        assert_eq!(items[0].link, "https://b");
        assert_eq!(items[0].id, "https://b");
        assert_eq!(parse_feed(xml), items);
    }

    #[test]
    fn summary_is_truncated() {
        let long = format!("<p>{}</p>", "a".repeat(500));
        let s = summarize(&long);
        assert_eq!(s.chars().count(), SUMMARY_CHARS + 3);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn new_articles_stop_at_cursor() {
        let items = parse_feed(FEED);
        let fresh = new_articles(&items, Some("https://medium.com/p/def"));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "https://medium.com/p/abc");

        assert_eq!(new_articles(&items, None).len(), 3);
        assert!(new_articles(&items, Some("https://medium.com/p/abc")).is_empty());
    }

    #[test]
    fn new_articles_bounded() {
        let many: Vec<Article> = (0..8)
            .map(|i| Article {
                id: i.to_string(),
                title: String::new(),
                link: String::new(),
                summary: String::new(),
                published: String::new(),
            })
            .collect();
        assert_eq!(new_articles(&many, Some("7")).len(), MAX_ENTRIES);
    }

    #[test]
    fn feed_url_shape() {
        assert_eq!(
            feed_url("https://medium.com/", "@VS1.finance"),
            "https://medium.com/feed/@VS1.finance"
        );
    }
}
