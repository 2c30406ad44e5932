//! Configuration loader and validator for the feed→Telegram relay bot.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::Role;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub twitter: Twitter,
    pub medium: Medium,
    #[serde(default)]
    pub influencers: Influencers,
    #[serde(default)]
    pub schedule: Schedule,
    pub recipients: Recipients,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: i32,
    /// When false, the first fetch of a feed only records its newest id.
    #[serde(default)]
    pub notify_on_first_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Channel whose posts are relayed to team members.
    #[serde(default)]
    pub source_channel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Twitter {
    pub official_account: String,
    #[serde(default)]
    pub bearer_tokens: Vec<String>,
    /// Calls allowed per token per calendar month; 0 disables the budget.
    #[serde(default = "default_monthly_call_limit")]
    pub monthly_call_limit: u32,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_twitter_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Medium {
    pub username: String,
    #[serde(default = "default_medium_base")]
    pub base_url: String,
    #[serde(default = "default_medium_timeout")]
    pub request_timeout_secs: u64,
}

/// Where the influencer list comes from and how much of it each run checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Influencers {
    /// Published CSV export of the influencer sheet.
    #[serde(default)]
    pub sheet_csv_url: Option<String>,
    /// Local CSV/text file, used when no URL is configured.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

impl Default for Influencers {
    fn default() -> Self {
        Self {
            sheet_csv_url: None,
            file: None,
            batch_size: default_batch_size(),
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

/// Polling cadences, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Schedule {
    pub official_check_secs: u64,
    pub medium_check_secs: u64,
    pub influencer_check_secs: u64,
    pub influencer_reload_secs: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            official_check_secs: 3 * 60 * 60,
            medium_check_secs: 30 * 60,
            influencer_check_secs: 6 * 60 * 60,
            influencer_reload_secs: 12 * 60 * 60,
        }
    }
}

impl Schedule {
    pub fn official_check(&self) -> Duration {
        Duration::from_secs(self.official_check_secs)
    }

    pub fn medium_check(&self) -> Duration {
        Duration::from_secs(self.medium_check_secs)
    }

    pub fn influencer_check(&self) -> Duration {
        Duration::from_secs(self.influencer_check_secs)
    }

    pub fn influencer_reload(&self) -> Duration {
        Duration::from_secs(self.influencer_reload_secs)
    }
}

/// Static recipient registry, in priority order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipients {
    pub influencer_managers: Vec<Member>,
    pub team_members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub chat_id: i64,
}

fn default_max_delivery_attempts() -> i32 {
    8
}

fn default_monthly_call_limit() -> u32 {
    100
}

fn default_max_results() -> u32 {
    5
}

fn default_twitter_api_base() -> String {
    "https://api.twitter.com/2/".into()
}

fn default_medium_base() -> String {
    "https://medium.com".into()
}

fn default_medium_timeout() -> u64 {
    30
}

fn default_batch_size() -> usize {
    50
}

fn default_request_delay_ms() -> u64 {
    500
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL used when `DATABASE_URL` is not set.
    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/relay.db", self.app.data_dir.trim_end_matches('/'))
    }

    /// Rough monthly call estimate for the configured cadences, assuming every
    /// influencer in one batch costs a timeline call.
    pub fn estimated_monthly_calls(&self) -> u64 {
        let month = 30 * 24 * 60 * 60;
        let per = |secs: u64| if secs == 0 { 0 } else { month / secs };
        per(self.schedule.official_check_secs)
            + per(self.schedule.influencer_check_secs) * self.influencers.batch_size as u64
            + per(self.schedule.influencer_reload_secs)
    }

    pub fn monthly_call_budget(&self) -> u64 {
        self.twitter.bearer_tokens.len() as u64 * u64::from(self.twitter.monthly_call_limit)
    }
}

impl Recipients {
    /// Role for a chat id; managers take precedence over team membership.
    pub fn role_of(&self, chat_id: i64) -> Option<Role> {
        if self.influencer_managers.iter().any(|m| m.chat_id == chat_id) {
            Some(Role::InfluencerManager)
        } else if self.team_members.iter().any(|m| m.chat_id == chat_id) {
            Some(Role::TeamMember)
        } else {
            None
        }
    }

    /// Members that receive official-account, Medium and channel notifications.
    /// Anyone who is also a manager is left out.
    pub fn team_members(&self) -> impl Iterator<Item = &Member> {
        self.team_members.iter().filter(move |m| {
            !self
                .influencer_managers
                .iter()
                .any(|mgr| mgr.chat_id == m.chat_id)
        })
    }

    pub fn influencer_managers(&self) -> &[Member] {
        &self.influencer_managers
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Overlay secrets and deployment-specific values from the environment.
///
/// `TWITTER_BEARER_TOKEN_1..9` replace the configured token list when any is
/// set; otherwise a single `TWITTER_BEARER_TOKEN` is used if present.
pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
        cfg.telegram.bot_token = token;
    }
    if let Some(channel) = non_empty("SOURCE_CHANNEL_ID") {
        cfg.telegram.source_channel_id = Some(channel);
    }
    if let Some(url) = non_empty("INFLUENCER_SHEET_CSV_URL") {
        cfg.influencers.sheet_csv_url = Some(url);
    }

    let numbered: Vec<String> = (1..10)
        .filter_map(|i| non_empty(&format!("TWITTER_BEARER_TOKEN_{i}")))
        .collect();
    if !numbered.is_empty() {
        cfg.twitter.bearer_tokens = numbered;
    } else if let Some(single) = non_empty("TWITTER_BEARER_TOKEN") {
        cfg.twitter.bearer_tokens = vec![single];
    }
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_delivery_attempts <= 0 {
        return Err(ConfigError::Invalid("app.max_delivery_attempts must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.twitter.official_account.trim().is_empty() {
        return Err(ConfigError::Invalid("twitter.official_account must be non-empty"));
    }
    if cfg.twitter.bearer_tokens.iter().any(|t| t.trim().is_empty()) {
        return Err(ConfigError::Invalid("twitter.bearer_tokens must not contain empty tokens"));
    }
    // The v2 timeline endpoint accepts 5..=100.
    if !(5..=100).contains(&cfg.twitter.max_results) {
        return Err(ConfigError::Invalid("twitter.max_results must be within 5..=100"));
    }

    if cfg.medium.username.trim().is_empty() {
        return Err(ConfigError::Invalid("medium.username must be non-empty"));
    }

    if cfg.influencers.batch_size == 0 {
        return Err(ConfigError::Invalid("influencers.batch_size must be > 0"));
    }

    let s = &cfg.schedule;
    if s.official_check_secs == 0 {
        return Err(ConfigError::Invalid("schedule.official_check_secs must be > 0"));
    }
    if s.medium_check_secs == 0 {
        return Err(ConfigError::Invalid("schedule.medium_check_secs must be > 0"));
    }
    if s.influencer_check_secs == 0 {
        return Err(ConfigError::Invalid("schedule.influencer_check_secs must be > 0"));
    }
    if s.influencer_reload_secs == 0 {
        return Err(ConfigError::Invalid("schedule.influencer_reload_secs must be > 0"));
    }

    let r = &cfg.recipients;
    if r.influencer_managers.is_empty() {
        return Err(ConfigError::Invalid("recipients.influencer_managers must be non-empty"));
    }
    if r.team_members.is_empty() {
        return Err(ConfigError::Invalid("recipients.team_members must be non-empty"));
    }
    if has_duplicate_ids(&r.influencer_managers) {
        return Err(ConfigError::Invalid("recipients.influencer_managers has duplicate chat_id"));
    }
    // Assignment counts are keyed by manager name.
    if has_duplicate_names(&r.influencer_managers) {
        return Err(ConfigError::Invalid("recipients.influencer_managers has duplicate name"));
    }
    if has_duplicate_ids(&r.team_members) {
        return Err(ConfigError::Invalid("recipients.team_members has duplicate chat_id"));
    }
    if r
        .influencer_managers
        .iter()
        .chain(r.team_members.iter())
        .any(|m| m.name.trim().is_empty())
    {
        return Err(ConfigError::Invalid("recipients entries must have a name"));
    }

    Ok(())
}

fn has_duplicate_ids(members: &[Member]) -> bool {
    let mut seen = HashSet::new();
    members.iter().any(|m| !seen.insert(m.chat_id))
}

fn has_duplicate_names(members: &[Member]) -> bool {
    let mut seen = HashSet::new();
    members.iter().any(|m| !seen.insert(m.name.trim()))
}

/// Example configuration with the stock cadences.
pub fn example() -> &'static str {
    include_str!("../config.example.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.schedule, Schedule::default());
        assert_eq!(cfg.twitter.bearer_tokens.len(), 4);
        assert_eq!(cfg.monthly_call_budget(), 400);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 60
telegram:
  bot_token: "t"
twitter:
  official_account: "acct"
medium:
  username: "pub"
recipients:
  influencer_managers: [{ name: "m", chat_id: 1 }]
  team_members: [{ name: "t", chat_id: 2 }]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.schedule.official_check(), Duration::from_secs(3 * 3600));
        assert_eq!(cfg.schedule.medium_check(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.schedule.influencer_check(), Duration::from_secs(6 * 3600));
        assert_eq!(cfg.schedule.influencer_reload(), Duration::from_secs(12 * 3600));
        assert_eq!(cfg.influencers.batch_size, 50);
        assert_eq!(cfg.twitter.monthly_call_limit, 100);
        assert_eq!(cfg.app.max_delivery_attempts, 8);
        assert!(!cfg.app.notify_on_first_run);
        assert!(cfg.telegram.source_channel_id.is_none());
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg = example_cfg();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_schedule_and_batch() {
        let mut cfg = example_cfg();
        cfg.schedule.medium_check_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("medium_check_secs")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.influencers.batch_size = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.twitter.max_results = 3;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_recipients() {
        let mut cfg = example_cfg();
        cfg.recipients.team_members.clear();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("team_members")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.recipients.influencer_managers[1].chat_id = 1001;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("duplicate")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn duplicate_manager_names_rejected() {
        let mut cfg = example_cfg();
        cfg.recipients.influencer_managers[1].name = "Manager A".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => {
                assert_eq!(msg, "recipients.influencer_managers has duplicate name")
            }
            _ => panic!("wrong error"),
        }

        // Team members are not counted per name, so shared names are fine.
        let mut cfg = example_cfg();
        cfg.recipients.team_members[1].name = "Member A".into();
        validate(&cfg).unwrap();
    }

    #[test]
    fn env_overrides_numbered_tokens() {
        let mut cfg = example_cfg();
        let env: HashMap<&str, &str> = HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "from-env"),
            ("TWITTER_BEARER_TOKEN_1", "a"),
            ("TWITTER_BEARER_TOKEN_3", "c"),
            ("TWITTER_BEARER_TOKEN", "single"),
        ]);
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.telegram.bot_token, "from-env");
        assert_eq!(cfg.twitter.bearer_tokens, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn env_overrides_single_token_fallback() {
        let mut cfg = example_cfg();
        let env: HashMap<&str, &str> =
            HashMap::from([("TWITTER_BEARER_TOKEN", "single"), ("SOURCE_CHANNEL_ID", "-1009")]);
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.twitter.bearer_tokens, vec!["single".to_string()]);
        assert_eq!(cfg.telegram.source_channel_id.as_deref(), Some("-1009"));
    }

    #[test]
    fn role_lookup_prefers_manager() {
        let mut cfg = example_cfg();
        cfg.recipients.team_members.push(Member {
            name: "Manager A".into(),
            chat_id: 1001,
        });
        let r = &cfg.recipients;
        assert_eq!(r.role_of(1001), Some(Role::InfluencerManager));
        assert_eq!(r.role_of(2001), Some(Role::TeamMember));
        assert_eq!(r.role_of(42), None);
        let ids: Vec<i64> = r.team_members().map(|m| m.chat_id).collect();
        assert_eq!(ids, vec![2001, 2002]);
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.default_database_url().ends_with("/data/relay.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.recipients.influencer_managers.len(), 3);
    }
}
