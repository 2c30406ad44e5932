//! Telegram surface: outbound delivery, bot commands and the channel relay.
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, instrument};

use crate::db::{self, Pool, RelayStats};
use crate::model::{Notification, Role};
use crate::notify::Notifier;

/// Outbound text delivery. Implemented for the real bot and for test doubles.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[async_trait]
impl Messenger for Bot {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.send_message(ChatId(chat_id), text.to_string()).await?;
        Ok(())
    }
}

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Commands:")]
pub enum Command {
    #[command(description = "Start")]
    Start,
    #[command(description = "Help")]
    Help,
    #[command(description = "Show my Telegram ID")]
    MyId,
    #[command(description = "Show statistics")]
    Stats,
}

/// Shared state handed to every update handler.
#[derive(Debug, Clone)]
pub struct BotContext {
    pub pool: Pool,
    pub notifier: Notifier,
    pub official_account: String,
    pub source_channel_id: Option<String>,
}

pub fn schema() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(Update::filter_channel_post().endpoint(handle_channel_post))
}

/// Run the dispatcher until Ctrl-C.
pub async fn run(bot: Bot, ctx: Arc<BotContext>) {
    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![ctx])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

#[instrument(skip_all, fields(chat = msg.chat.id.0))]
async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<BotContext>,
) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let first_name = msg
        .from()
        .map(|u| u.first_name.clone())
        .unwrap_or_default();
    let role = ctx.notifier.recipients().role_of(chat_id);

    let reply = match cmd {
        Command::Start => start_text(&first_name, chat_id, role, &ctx.official_account),
        Command::Help => help_text(),
        Command::MyId => myid_text(&first_name, chat_id, role),
        Command::Stats => {
            if role != Some(Role::InfluencerManager) {
                "This command is only available for managers.".to_string()
            } else {
                let month = db::month_key(Utc::now());
                match db::relay_stats(&ctx.pool, &ctx.notifier.manager_names(), &month).await {
                    Ok(stats) => stats_text(&stats),
                    Err(err) => {
                        error!(?err, "failed to collect stats");
                        "Stats not available.".to_string()
                    }
                }
            }
        }
    };
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

#[instrument(skip_all, fields(chat = msg.chat.id.0))]
async fn handle_channel_post(msg: Message, ctx: Arc<BotContext>) -> ResponseResult<()> {
    let Some(source) = ctx.source_channel_id.as_deref() else {
        return Ok(());
    };
    if !is_source_channel(source, msg.chat.id.0) {
        return Ok(());
    }
    let Some(text) = channel_text(msg.text(), msg.caption()) else {
        return Ok(());
    };
    match ctx
        .notifier
        .enqueue(&ctx.pool, &Notification::ChannelMessage(text))
        .await
    {
        Ok(sent) => info!(recipients = sent.len(), "relayed channel post"),
        Err(err) => error!(?err, "failed to enqueue channel post"),
    }
    Ok(())
}

/// Channel ids are accepted with or without the `-100` supergroup prefix.
pub fn is_source_channel(configured: &str, chat_id: i64) -> bool {
    let configured = configured.trim();
    let id = chat_id.to_string();
    id == configured || id == configured.replacen("-100", "", 1)
}

pub fn channel_text(text: Option<&str>, caption: Option<&str>) -> Option<String> {
    text.or(caption)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

pub fn start_text(first_name: &str, chat_id: i64, role: Option<Role>, official: &str) -> String {
    let Some(role) = role else {
        return format!(
            "Hey {first_name}!\n\nI'm the team coordination bot.\n\n\
             Your Telegram ID is not in the team list.\nID: {chat_id}\n\n\
             If you're a team member, ask an admin to add your ID."
        );
    };
    let topics = match role {
        Role::InfluencerManager => format!("• New influencer posts mentioning @{official}"),
        Role::TeamMember => format!(
            "• New posts on X (@{official})\n• Live X Spaces\n• New Medium articles\n• Team channel messages"
        ),
    };
    format!(
        "Hey {first_name}!\n\nYou're in the team list.\nRole: {}\n\n\
         You'll receive notifications about:\n{topics}\n\n\
         Commands:\n• /help - Command list\n• /myid - Show my Telegram ID\n• /stats - Show statistics",
        role.label()
    )
}

pub fn help_text() -> String {
    format!(
        "{}\n\nNotifications are sent based on your role in the team.",
        Command::descriptions()
    )
}

pub fn myid_text(first_name: &str, chat_id: i64, role: Option<Role>) -> String {
    let status = role.map_or("Not in team list", |r| r.label());
    format!("Name: {first_name}\nTelegram ID: {chat_id}\nStatus: {status}")
}

pub fn stats_text(stats: &RelayStats) -> String {
    let mut lines = vec![
        "📊 Bot Statistics\n".to_string(),
        format!("Tracked influencers: {}", stats.influencers),
        format!("Cached user IDs: {}", stats.cached_user_ids),
        "\nManager assignments:".to_string(),
    ];
    lines.extend(
        stats
            .assignments
            .iter()
            .map(|a| format!("  {}: {}", a.manager, a.count)),
    );
    if !stats.token_usage.is_empty() {
        lines.push("\nTwitter API token usage (this month):".to_string());
        lines.extend(
            stats
                .token_usage
                .iter()
                .map(|u| format!("  Token {}: {} requests", u.token_index + 1, u.calls)),
        );
    }
    lines.push(format!("\nPending deliveries: {}", stats.pending_deliveries));
    lines.join("\n")
}
