use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    InfluencerManager,
    TeamMember,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::InfluencerManager => "influencer_manager",
            Role::TeamMember => "team_member",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::InfluencerManager => "Influencer Manager",
            Role::TeamMember => "Team Member",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub chat_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Twitter,
    Medium,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
            Platform::Medium => "medium",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedAccount {
    pub platform: Platform,
    pub handle: String,
    pub poll_interval: Duration,
}

impl WatchedAccount {
    pub fn new(platform: Platform, handle: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            platform,
            handle: handle.into(),
            poll_interval,
        }
    }

    /// Key under which the account's seen-post cursor is stored.
    pub fn cursor_key(&self) -> String {
        cursor_key(self.platform, &self.handle)
    }
}

pub fn cursor_key(platform: Platform, handle: &str) -> String {
    format!("{}:{}", platform.as_str(), handle.to_ascii_lowercase())
}

/// Influencer cursors live apart from watched-account cursors, so a handle
/// that is both never shares one.
pub fn influencer_cursor_key(handle: &str) -> String {
    format!("influencer:{}", cursor_key(Platform::Twitter, handle))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenPostCursor {
    pub account_key: String,
    pub last_seen_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tweet {
    pub id: String,
    pub text: String,
    pub username: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Tweet {
    pub fn link(&self) -> String {
        format!("https://x.com/{}/status/{}", self.username, self.id)
    }

    /// Live-space announcements are detected by keyword only.
    pub fn is_space(&self) -> bool {
        self.text.to_lowercase().contains("space")
    }

    pub fn mentions(&self, account: &str) -> bool {
        let needle = format!("@{}", account.to_lowercase());
        self.text.to_lowercase().contains(&needle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub published: String,
}

/// A message ready to be routed to recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    OfficialPost(Tweet),
    SpaceLive(Tweet),
    MediumArticle(Article),
    InfluencerPost(Tweet),
    ChannelMessage(String),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::OfficialPost(_) => "official_post",
            Notification::SpaceLive(_) => "space_live",
            Notification::MediumArticle(_) => "medium_article",
            Notification::InfluencerPost(_) => "influencer_post",
            Notification::ChannelMessage(_) => "channel_message",
        }
    }

    /// Which role receives this notification.
    pub fn audience(&self) -> Role {
        match self {
            Notification::InfluencerPost(_) => Role::InfluencerManager,
            _ => Role::TeamMember,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Notification::OfficialPost(t) => format!(
                "📢 New post from @{}\n\n{}\n\nLink: {}\n\nPlease like and repost to support!",
                t.username,
                t.text,
                t.link()
            ),
            Notification::SpaceLive(t) => format!(
                "🔴 X Space is LIVE!\n\n@{} started a Space:\n\n{}\n\nJoin: {}\n\nPlease join and support the team!",
                t.username,
                t.text,
                t.link()
            ),
            Notification::MediumArticle(a) => format!(
                "📝 New Medium article\n\nTitle: {}\n\n{}\n\nRead: {}\n\nPlease read and clap to support!",
                a.title, a.summary, a.link
            ),
            Notification::InfluencerPost(t) => format!(
                "🎯 Influencer post from @{}\n\n{}\n\nLink: {}\n\nPlease engage: like, repost, comment from official account.",
                t.username,
                t.text,
                t.link()
            ),
            Notification::ChannelMessage(text) => format!(
                "📣 New message from team channel\n\n{}\n\nPlease check and engage if needed.",
                text
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxTask {
    pub id: i64,
    pub chat_id: i64,
    pub recipient: String,
    pub kind: String,
    pub text: String,
    pub attempt: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tweet(text: &str) -> Tweet {
        Tweet {
            id: "17".into(),
            text: text.into(),
            username: "someone".into(),
            created_at: None,
        }
    }

    #[test]
    fn tweet_link_and_keywords() {
        let t = tweet("Join our SPACE tonight with @Official_Acct");
        assert_eq!(t.link(), "https://x.com/someone/status/17");
        assert!(t.is_space());
        assert!(t.mentions("official_acct"));
        assert!(!t.mentions("other"));
        assert!(!tweet("plain update").is_space());
    }

    #[test]
    fn cursor_keys_are_lowercased() {
        let acct = WatchedAccount::new(Platform::Twitter, "SomeUser", Duration::from_secs(1));
        assert_eq!(acct.cursor_key(), "twitter:someuser");
        assert_eq!(cursor_key(Platform::Medium, "Pub.Name"), "medium:pub.name");
        assert_eq!(influencer_cursor_key("SomeUser"), "influencer:twitter:someuser");
        assert_ne!(influencer_cursor_key("someuser"), acct.cursor_key());
    }

    #[test]
    fn audience_routing() {
        assert_eq!(
            Notification::InfluencerPost(tweet("x")).audience(),
            Role::InfluencerManager
        );
        assert_eq!(Notification::SpaceLive(tweet("x")).audience(), Role::TeamMember);
        assert_eq!(
            Notification::ChannelMessage("hi".into()).audience(),
            Role::TeamMember
        );
    }

    #[test]
    fn render_contains_link() {
        let text = Notification::OfficialPost(tweet("gm")).render();
        assert!(text.starts_with("📢 New post from @someone"));
        assert!(text.contains("Link: https://x.com/someone/status/17"));
    }
}
