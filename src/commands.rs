//! Chat commands.
//!
//! [`parse_command`] turns message text into a [`Command`]; the
//! [`CommandHandler`] runs it against the service context and produces the
//! reply text. Transport concerns stay in the channel.

use std::fmt::Write as _;
use std::sync::Arc;

use uuid::Uuid;

use crate::context::ServiceContext;
use crate::error::{LinkError, QueueError, VaultError};
use crate::links::{self, LinkTarget};
use crate::queue::StatusReport;
use crate::settings::{FileCategory, UserSettings};
use crate::vault::Credentials;

const HELP: &str = "\
How to use:

Public content: send the post link, e.g. https://t.me/channel/123
Private content: /login first, then send https://t.me/c/<chat_id>/123
Batches: https://t.me/channel/100-200 downloads posts 100 to 200
Bot chats: https://t.me/b/<botname>/<message_id>

/status  your queue
/cancel  cancel everything, or /cancel <task id>
/pause, /resume  hold or release your queue
/login <session>, /logout  manage your stored session
/setchat <chat id>  deliver to another chat (the bot must be able to post there); /setchat off to undo
/filters  show file filters; /filters <type> on|off to change one";

const ADMIN_HELP: &str = "\

Admin:
/stats  queue statistics
/priority <task id> <n>  reorder a task
/retry <task id>  requeue a failed task
/backup  write a task backup now";

const SETCHAT_USAGE: &str = "/setchat <chat id> | off";
const FILTERS_USAGE: &str =
    "/filters [document|archive|video|audio|photo|animation|sticker|voice on|off]";

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    /// A message carrying a link.
    Download(LinkTarget),
    /// A message that looked like a link but was not usable.
    BadLink(LinkError),
    Login { session: String },
    Logout,
    Cancel(Option<Uuid>),
    Status,
    Pause,
    Resume,
    /// Deliver to another chat; `None` restores the requesting chat.
    SetChat(Option<i64>),
    Filters,
    Filter { category: FileCategory, skip: bool },
    Stats,
    Priority { id: Uuid, priority: i64 },
    Retry(Uuid),
    Backup,
    /// Malformed arguments; the payload is the usage line.
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    /// Commands restricted to admins.
    pub fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Self::Stats | Self::Priority { .. } | Self::Retry(_) | Self::Backup
        )
    }
}

/// Parse message text. `None` for chatter that is neither a command nor a link.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('/') {
        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or("");
        // Strip a "@botname" suffix used in groups.
        let name = name.split('@').next().unwrap_or(name).to_lowercase();
        let args: Vec<&str> = parts.collect();
        return Some(parse_named(&name, &args));
    }
    links::find_link(text).map(|link| match links::parse_link(link) {
        Ok(target) => Command::Download(target),
        Err(e) => Command::BadLink(e),
    })
}

fn parse_named(name: &str, args: &[&str]) -> Command {
    match name {
        "start" => Command::Start,
        "help" => Command::Help,
        "login" => match args {
            [session] => Command::Login {
                session: (*session).to_string(),
            },
            _ => Command::Usage("/login <session string>"),
        },
        "logout" => Command::Logout,
        "cancel" => match args {
            [] => Command::Cancel(None),
            [id] => match id.parse() {
                Ok(id) => Command::Cancel(Some(id)),
                Err(_) => Command::Usage("/cancel [task id]"),
            },
            _ => Command::Usage("/cancel [task id]"),
        },
        "status" => Command::Status,
        "pause" => Command::Pause,
        "resume" => Command::Resume,
        "setchat" => match args {
            ["off" | "reset"] => Command::SetChat(None),
            [chat] => match chat.parse() {
                Ok(chat) => Command::SetChat(Some(chat)),
                Err(_) => Command::Usage(SETCHAT_USAGE),
            },
            _ => Command::Usage(SETCHAT_USAGE),
        },
        "filters" => match args {
            [] => Command::Filters,
            [category, switch] => match (category.parse(), switch.to_lowercase().as_str()) {
                (Ok(category), "on") => Command::Filter {
                    category,
                    skip: false,
                },
                (Ok(category), "off") => Command::Filter {
                    category,
                    skip: true,
                },
                _ => Command::Usage(FILTERS_USAGE),
            },
            _ => Command::Usage(FILTERS_USAGE),
        },
        "stats" => Command::Stats,
        "priority" => match args {
            [id, priority] => match (id.parse(), priority.parse()) {
                (Ok(id), Ok(priority)) => Command::Priority { id, priority },
                _ => Command::Usage("/priority <task id> <number>"),
            },
            _ => Command::Usage("/priority <task id> <number>"),
        },
        "retry" => match args.first().map(|id| id.parse()) {
            Some(Ok(id)) => Command::Retry(id),
            _ => Command::Usage("/retry <task id>"),
        },
        "backup" => Command::Backup,
        other => Command::Unknown(other.to_string()),
    }
}

/// Who sent a command and where to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sender {
    pub user_id: i64,
    pub chat_id: i64,
}

/// What to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Remove the user's message (it carried a secret).
    pub delete_request: bool,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delete_request: false,
        }
    }
}

pub struct CommandHandler {
    ctx: Arc<ServiceContext>,
}

impl CommandHandler {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, sender: Sender, command: Command) -> Reply {
        if command.is_admin_only() && !self.ctx.is_admin(sender.user_id) {
            tracing::warn!(user_id = sender.user_id, ?command, "Admin command refused");
            return Reply::text("⛔ This command is for admins only.");
        }
        tracing::debug!(user_id = sender.user_id, ?command, "Handling command");

        let carries_secret = matches!(command, Command::Login { .. });
        let engine = &self.ctx.engine;
        let user = sender.user_id;
        let result: Result<Reply, QueueError> = async {
            Ok(match command {
                Command::Start => Reply::text(format!(
                    "👋 Welcome! Send me a Telegram post link and I'll fetch it for you.\n\n{HELP}"
                )),
                Command::Help => {
                    let mut text = HELP.to_string();
                    if self.ctx.is_admin(user) {
                        text.push_str(ADMIN_HELP);
                    }
                    Reply::text(text)
                }
                Command::Download(LinkTarget::Single(source)) => {
                    let id = engine.enqueue(user, sender.chat_id, source.clone()).await?;
                    Reply::text(format!("📥 Queued {source}\nTask: {id}"))
                }
                Command::Download(LinkTarget::Range(request)) => {
                    let chat = request.chat.clone();
                    let ids = engine.enqueue_batch(user, sender.chat_id, request).await?;
                    Reply::text(format!("📦 Queued {} messages from {chat}", ids.len()))
                }
                Command::BadLink(e) => Reply::text(format!("⚠️ {e}")),
                Command::Login { session } => {
                    engine.login(user, &Credentials::new(session)).await?;
                    Reply::text("🔐 Session stored. Your message was deleted.")
                }
                Command::Logout => {
                    if engine.logout(user).await? {
                        Reply::text("👋 Logged out; stored session removed.")
                    } else {
                        Reply::text("You were not logged in.")
                    }
                }
                Command::Cancel(Some(id)) => {
                    engine.cancel(Some(user), id).await?;
                    Reply::text(format!("🚫 Cancelled {id}"))
                }
                Command::Cancel(None) => {
                    let count = engine.cancel_all(user).await?;
                    Reply::text(format!("🚫 Cancelled {count} task(s)."))
                }
                Command::Status => Reply::text(render_status(&engine.status(user).await?)),
                Command::Pause => {
                    if engine.pause(user).await {
                        Reply::text("⏸️ Queue paused. Running downloads finish; /resume to continue.")
                    } else {
                        Reply::text("Your queue is already paused.")
                    }
                }
                Command::Resume => {
                    if engine.resume(user).await {
                        Reply::text("▶️ Queue resumed.")
                    } else {
                        Reply::text("Your queue is not paused.")
                    }
                }
                Command::SetChat(target) => {
                    engine.set_target_chat(user, target).await?;
                    match target {
                        Some(chat) => Reply::text(format!(
                            "🎯 New downloads will be sent to {chat}."
                        )),
                        None => Reply::text("🎯 New downloads will be sent here."),
                    }
                }
                Command::Filters => Reply::text(render_settings(&engine.settings(user).await?)),
                Command::Filter { category, skip } => {
                    let settings = engine.set_filter(user, category, skip).await?;
                    Reply::text(render_settings(&settings))
                }
                Command::Stats => {
                    let stats = engine.admin_stats().await?;
                    let mut text = format!("📊 Tasks: {}\n", stats.total());
                    let mut states: Vec<_> = stats.by_state.iter().collect();
                    states.sort_by_key(|(state, _)| state.as_str());
                    for (state, count) in states {
                        let _ = writeln!(text, "  {state}: {count}");
                    }
                    if !stats.failures_by_class.is_empty() {
                        text.push_str("Failures:\n");
                        let mut classes: Vec<_> = stats.failures_by_class.iter().collect();
                        classes.sort_by_key(|(class, _)| class.as_str());
                        for (class, count) in classes {
                            let _ = writeln!(text, "  {class}: {count}");
                        }
                    }
                    let _ = write!(
                        text,
                        "Running: {}\nPaused users: {}\nHeld users: {}\nSessions: {}",
                        stats.running,
                        stats.paused_users.len(),
                        stats.held_users.len(),
                        stats.sessions
                    );
                    Reply::text(text)
                }
                Command::Priority { id, priority } => {
                    engine.set_priority(id, priority).await?;
                    Reply::text(format!("⏫ {id} priority set to {priority}"))
                }
                Command::Retry(id) => {
                    engine.retry(id).await?;
                    Reply::text(format!("🔁 {id} requeued"))
                }
                Command::Backup => match self.ctx.backups.create_backup().await {
                    Ok(path) => Reply::text(format!("💾 Backup written: {}", path.display())),
                    Err(e) => {
                        tracing::error!(error = %e, "Manual backup failed");
                        Reply::text("❌ Backup failed; see logs.")
                    }
                },
                Command::Usage(usage) => Reply::text(format!("Usage: {usage}")),
                Command::Unknown(name) => {
                    Reply::text(format!("Unknown command /{name}. Try /help."))
                }
            })
        }
        .await;

        let mut reply = match result {
            Ok(reply) => reply,
            Err(e) => Reply::text(error_reply(&e)),
        };
        reply.delete_request = carries_secret;
        reply
    }
}

/// User-facing text for a failed command. Store and vault internals stay in
/// the logs.
fn error_reply(e: &QueueError) -> String {
    match e {
        QueueError::Vault(VaultError::Locked) => "🔒 Logins are disabled on this bot.".to_string(),
        QueueError::Store(_) | QueueError::Vault(_) => {
            tracing::error!(error = %e, "Command failed");
            "⚠️ Temporary problem, try again later.".to_string()
        }
        other => format!("⚠️ {other}"),
    }
}

fn render_settings(settings: &UserSettings) -> String {
    let mut text = String::from("File filters:\n");
    for category in FileCategory::ALL {
        let mark = if settings.skipped.contains(&category) {
            "🚫"
        } else {
            "✅"
        };
        let _ = writeln!(text, "{mark} {category}");
    }
    match settings.target_chat {
        Some(chat) => {
            let _ = write!(text, "Delivering to chat {chat}");
        }
        None => text.push_str("Delivering to this chat"),
    }
    text
}

fn render_status(report: &StatusReport) -> String {
    let mut text = String::new();
    if report.paused {
        text.push_str("⏸️ Your queue is paused.\n");
    }
    if report.held {
        text.push_str("🔐 Your session expired; /login to continue.\n");
    }
    if report.active.is_empty() {
        text.push_str("No active tasks.\n");
    } else {
        let _ = writeln!(text, "Active ({}):", report.active.len());
        for task in report.active.iter().take(20) {
            let _ = write!(text, "• {} {} [{}]", task.source, task.state, task.id);
            if let Some(percent) = task.progress_percent.filter(|_| task.state.is_claimed()) {
                let _ = write!(text, " {percent}%");
            }
            if let Some(error) = &task.error {
                let _ = write!(text, " (last error: {error})");
            }
            text.push('\n');
        }
        if report.active.len() > 20 {
            let _ = writeln!(text, "… and {} more", report.active.len() - 20);
        }
    }
    for batch in &report.batches {
        let _ = writeln!(
            text,
            "Batch {}: {}/{} done, {} failed, {} cancelled, {} left ({:.0}% success)",
            &batch.batch_id.to_string()[..8],
            batch.completed,
            batch.total,
            batch.failed,
            batch.cancelled,
            batch.remaining,
            batch.success_rate
        );
    }
    if !report.recent.is_empty() {
        text.push_str("Recent:\n");
        for task in &report.recent {
            let _ = write!(text, "• {} {}", task.source, task.state);
            if let Some(error) = &task.error {
                let _ = write!(text, ": {error}");
            }
            text.push('\n');
        }
    }
    text.trim_end().to_string()
}
