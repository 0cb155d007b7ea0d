//! The /command surface.
//!
//! Syntax is `/name[@botusername] [args…]`. In group chats a command
//! addressed to a different bot is silently ignored; an unknown command is
//! deleted or ignored per the chat's `unknown-command-action` setting.
//! Admin-gated commands check the cached admin list plus `bot.bot_owners`.

use async_trait::async_trait;
use tracing::{info, warn};

use govorun_channels::types::{EventKind, IncomingEvent, OutgoingAction};
use govorun_storage::types::{
    ChatKind, MessageCategory, SpamReason, SpamRecord, StoredMessage,
};

use crate::app::App;
use crate::error::{BotError, Result};
use crate::handlers::{wizard, Flow, Handler};
use crate::pipeline;
use crate::remind;
use crate::settings::ResolvedSettings;
use crate::summarize;

pub struct Commands;

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub bot: Option<String>,
    pub args: String,
}

/// Parse `/name[@bot] [args…]`; anything else is not a command.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let (name, bot) = match head.split_once('@') {
        Some((name, bot)) => (name, Some(bot.to_string())),
        None => (head, None),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(ParsedCommand {
        name: name.to_ascii_lowercase(),
        bot,
        args: args.to_string(),
    })
}

#[async_trait]
impl Handler for Commands {
    fn name(&self) -> &'static str {
        "commands"
    }

    fn matches(&self, event: &IncomingEvent, _settings: &ResolvedSettings) -> bool {
        event.kind == EventKind::MessageCreated && event.text().starts_with('/')
    }

    async fn handle(
        &self,
        app: &App,
        event: &IncomingEvent,
        settings: &ResolvedSettings,
    ) -> Result<Flow> {
        let Some(command) = parse_command(event.text()) else {
            return Ok(Flow::Halt);
        };

        // Group chats: a /cmd@otherbot is not addressed to us.
        let platform = app.platform(&event.platform)?;
        if event.chat.kind != ChatKind::Private {
            if let Some(bot) = &command.bot {
                if !bot.eq_ignore_ascii_case(&platform.bot_username) {
                    return Ok(Flow::Halt);
                }
            }
        }

        let admin = app
            .is_admin(
                &event.platform,
                event.chat.chat_id,
                event.user.user_id,
                event.user.username.as_deref(),
            )
            .await;
        let owner = app.is_owner(event.user.username.as_deref());

        if requires_admin(&command.name) && !admin {
            return reply(app, event, "This command is for chat admins.", MessageCategory::BotCommandReply).await;
        }
        if requires_owner(&command.name) && !owner {
            return reply(app, event, "This command is for bot owners.", MessageCategory::BotCommandReply).await;
        }

        info!(
            chat = event.chat.chat_id,
            user = event.user.user_id,
            command = %command.name,
            "command received"
        );

        let outcome = match command.name.as_str() {
            "start" | "help" => Some((help_text(), MessageCategory::BotCommandReply)),
            "echo" => Some((
                if command.args.is_empty() {
                    "nothing to echo".to_string()
                } else {
                    command.args.clone()
                },
                MessageCategory::BotCommandReply,
            )),
            "configure" => Some((
                wizard::start(app, event, settings).await?,
                MessageCategory::BotCommandReply,
            )),
            "settings" => Some((
                settings_view(app, event, settings, command.args == "debug").await?,
                MessageCategory::BotCommandReply,
            )),
            "set" => Some((set_setting(app, event, &command.args)?, MessageCategory::BotCommandReply)),
            "unset" => Some((unset_setting(app, event, &command.args)?, MessageCategory::BotCommandReply)),
            "weather" => Some((weather(app, &command.args).await?, MessageCategory::BotCommandReply)),
            "search" => Some((search(app, &command.args).await?, MessageCategory::BotCommandReply)),
            "draw" => draw(app, event, &command.args).await?.map(|t| (t, MessageCategory::BotCommandReply)),
            "analyze" => Some((analyze(app, event, settings, &command.args).await?, MessageCategory::BotCommandReply)),
            "summary" => Some((summary(app, event, settings, &command.args).await?, MessageCategory::BotSummary)),
            "remind" => Some((remind::command(app, event, &command.args)?, MessageCategory::BotCommandReply)),
            "spam" => Some((mark_spam(app, event, settings).await?, MessageCategory::BotCommandReply)),
            "learn_spam" => Some((learn(app, event, settings, true)?, MessageCategory::BotCommandReply)),
            "learn_ham" => Some((learn(app, event, settings, false)?, MessageCategory::BotCommandReply)),
            "get_spam_score" => Some((spam_score(app, event, settings)?, MessageCategory::BotCommandReply)),
            "unban" => Some((unban(app, event, settings, &command.args).await?, MessageCategory::BotCommandReply)),
            "pretrain_bayes" => Some((pretrain(app, event, settings, &command.args)?, MessageCategory::BotCommandReply)),
            "models" => Some((models(app), MessageCategory::BotCommandReply)),
            _ => {
                return unknown_command(app, event, settings).await;
            }
        };

        if let Some((text, category)) = outcome {
            return reply(app, event, &text, category).await;
        }
        Ok(Flow::Halt)
    }
}

fn requires_admin(name: &str) -> bool {
    matches!(
        name,
        "configure"
            | "settings"
            | "set"
            | "unset"
            | "spam"
            | "learn_spam"
            | "learn_ham"
            | "get_spam_score"
            | "unban"
            | "pretrain_bayes"
    )
}

fn requires_owner(name: &str) -> bool {
    name == "models"
}

async fn reply(
    app: &App,
    event: &IncomingEvent,
    text: &str,
    category: MessageCategory,
) -> Result<Flow> {
    let message_id = event.message.as_ref().map(|m| m.message_id.clone());
    let sent = app
        .send_text_now(
            &event.platform,
            event.chat.chat_id,
            event.chat.topic_id,
            text,
            message_id.as_deref(),
        )
        .await?;
    pipeline::persist_bot_reply(app, event, &sent.message_id, text, category)?;
    Ok(Flow::Halt)
}

async fn unknown_command(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
) -> Result<Flow> {
    if settings.unknown_command_action() == "delete" {
        if let Some(message) = &event.message {
            app.platform(&event.platform)?
                .outbox
                .submit(OutgoingAction::DeleteMessages {
                    chat_id: event.chat.chat_id,
                    message_ids: vec![message.message_id.clone()],
                })
                .await?;
        }
    }
    Ok(Flow::Halt)
}

fn help_text() -> String {
    "I am a conversational assistant. Talk to me, or use:\n\
     /weather <city> [cc] — current weather\n\
     /search <query> — web search\n\
     /draw <prompt> — generate an image\n\
     /analyze [prompt] — describe a photo (send as reply)\n\
     /summary [n] — recap recent conversation\n\
     /remind <when> [text] — schedule a reminder (e.g. /remind 10m tea)\n\
     Chat admins also get /configure, /settings, /set, /unset and the spam \
     commands (/spam, /learn_spam, /learn_ham, /get_spam_score, /unban, /pretrain_bayes)."
        .to_string()
}

async fn settings_view(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
    debug: bool,
) -> Result<String> {
    let mut out = String::from("Resolved settings:\n");
    for (name, value) in settings.entries() {
        out.push_str(&format!("  {name} = {value}\n"));
    }
    if debug {
        let chat_id = event.chat.chat_id;
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let total = app.storage.daily_message_count(chat_id, &today, None)?;
        let mine = app
            .storage
            .user_daily_message_count(chat_id, event.user.user_id, &today, None)?;
        let source = app.storage.source_for_chat(chat_id, None)?;
        out.push_str(&format!(
            "\nDebug:\n  data source: {} (readonly: {})\n  messages today: {total}\n  yours today: {mine}\n",
            source.name(),
            source.is_readonly(),
        ));
    }
    Ok(out)
}

fn set_setting(app: &App, event: &IncomingEvent, args: &str) -> Result<String> {
    let (key, value) = args
        .split_once(char::is_whitespace)
        .map(|(k, v)| (k.trim(), v.trim()))
        .ok_or_else(|| BotError::Validation("usage: /set <key> <value>".to_string()))?;
    let stored = app
        .settings
        .set(event.chat.chat_id, event.chat.kind, key, value)?;
    Ok(format!("{key} = {stored}"))
}

fn unset_setting(app: &App, event: &IncomingEvent, args: &str) -> Result<String> {
    let key = args.trim();
    if key.is_empty() {
        return Err(BotError::Validation("usage: /unset <key>".to_string()));
    }
    app.settings.unset(event.chat.chat_id, event.chat.kind, key)?;
    Ok(format!("{key} reset to its default"))
}

async fn weather(app: &App, args: &str) -> Result<String> {
    let service = app
        .services
        .weather
        .as_ref()
        .ok_or_else(|| BotError::Validation("Weather is not configured.".to_string()))?;
    if args.is_empty() {
        return Err(BotError::Validation("usage: /weather <city> [cc]".to_string()));
    }
    // A trailing two-letter token is a country code.
    let (city, country) = match args.rsplit_once(' ') {
        Some((city, cc)) if cc.len() == 2 && cc.chars().all(|c| c.is_ascii_alphabetic()) => {
            (city.trim(), Some(cc))
        }
        _ => (args, None),
    };
    let report = service.current(city, country).await?;
    Ok(format!(
        "{}: {}, {:.1}C (feels like {:.1}C), wind {:.1} m/s, humidity {}%",
        report.city,
        report.description,
        report.temp_c,
        report.feels_like_c,
        report.wind_ms,
        report.humidity,
    ))
}

async fn search(app: &App, args: &str) -> Result<String> {
    let service = app
        .services
        .search
        .as_ref()
        .ok_or_else(|| BotError::Validation("Search is not configured.".to_string()))?;
    if args.is_empty() {
        return Err(BotError::Validation("usage: /search <query>".to_string()));
    }
    let hits = service.search(args, 0).await?;
    if hits.is_empty() {
        return Ok("No results.".to_string());
    }
    let mut out = String::new();
    for hit in hits.iter().take(5) {
        out.push_str(&format!("{} — {}\n", hit.title, hit.url));
    }
    Ok(out)
}

/// /draw sends the image itself; there is no text reply on success.
async fn draw(app: &App, event: &IncomingEvent, args: &str) -> Result<Option<String>> {
    use govorun_channels::types::OutgoingMedia;

    let service = app
        .services
        .image
        .as_ref()
        .ok_or_else(|| BotError::Validation("Image generation is not configured.".to_string()))?;
    let prompt = if args.is_empty() { "something surprising" } else { args };
    let generated = service.generate(prompt).await?;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    let bytes = STANDARD
        .decode(&generated.base64)
        .map_err(|e| BotError::Internal(format!("bad image payload: {e}")))?;

    app.platform(&event.platform)?
        .outbox
        .submit(OutgoingAction::SendMedia {
            chat_id: event.chat.chat_id,
            topic_id: event.chat.topic_id,
            media: OutgoingMedia::Bytes {
                name: "generated.png".to_string(),
                mime: "image/png".to_string(),
                bytes,
                caption: generated.prompt,
            },
        })
        .await?;
    Ok(None)
}

/// /analyze replies to a photo; the vision model describes it.
async fn analyze(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
    args: &str,
) -> Result<String> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let replied = replied_message(app, event)?;
    let media_id = replied
        .media_id
        .clone()
        .ok_or_else(|| BotError::Validation("Reply to a photo to analyze it.".to_string()))?;
    let attachment = app.storage.get_attachment(&media_id, None)?;

    let platform = app.platform(&event.platform)?;
    let bytes = platform.outbound.download_file(&attachment.file_id).await?;

    let vision_model = app
        .services
        .image
        .as_ref()
        .and_then(|s| s.vision_model.clone())
        .map(Ok)
        .unwrap_or_else(|| app.model_for(settings.chat_model()))?;

    let prompt = if args.is_empty() {
        "Describe this image in a couple of sentences."
    } else {
        args
    };
    let mut message = govorun_llm::ChatMessage::user(prompt.to_string());
    message.images.push(govorun_llm::ImagePart {
        mime: if attachment.mime.is_empty() {
            "image/jpeg".to_string()
        } else {
            attachment.mime.clone()
        },
        base64: STANDARD.encode(&bytes),
    });
    let reply = app
        .dispatcher
        .complete(&vision_model, vec![message], &[], None)
        .await?;

    // Keep the synthesized description with the attachment.
    if let Err(e) = app
        .storage
        .set_attachment_description(&media_id, &reply.text, None)
    {
        warn!(media = %media_id, error = %e, "description persist failed");
    }
    Ok(reply.text)
}

async fn summary(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
    args: &str,
) -> Result<String> {
    let count: usize = args
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(50)
        .clamp(2, 200);
    let messages = app
        .storage
        .recent_messages(event.chat.chat_id, event.chat.topic_id, count, None)?;
    let model = app.model_for(settings.chat_model())?;
    summarize::summarize_messages(
        &app.dispatcher,
        &app.storage,
        &model,
        event.chat.chat_id,
        event.chat.topic_id,
        &messages,
    )
    .await
}

async fn mark_spam(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
) -> Result<String> {
    let target = replied_message(app, event)?;
    let record = SpamRecord {
        chat_id: target.chat_id,
        user_id: target.user_id,
        message_id: target.message_id.clone(),
        text: target.text.clone(),
        reason: SpamReason::Admin,
        score: 1.0,
    };
    app.storage.mark_message_spam(&record, None)?;
    learn_text(app, event.chat.chat_id, settings, &target.text, true)?;

    let platform = app.platform(&event.platform)?;
    platform
        .outbox
        .submit(OutgoingAction::DeleteMessages {
            chat_id: target.chat_id,
            message_ids: vec![target.message_id.clone()],
        })
        .await?;
    platform
        .outbox
        .submit(OutgoingAction::BanUser {
            chat_id: target.chat_id,
            user_id: target.user_id,
        })
        .await?;
    Ok("Labeled as spam, message removed, sender banned.".to_string())
}

fn learn(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
    is_spam: bool,
) -> Result<String> {
    let target = replied_message(app, event)?;
    learn_text(app, event.chat.chat_id, settings, &target.text, is_spam)?;

    let record = SpamRecord {
        chat_id: target.chat_id,
        user_id: target.user_id,
        message_id: target.message_id.clone(),
        text: target.text.clone(),
        reason: SpamReason::Admin,
        score: if is_spam { 1.0 } else { 0.0 },
    };
    if is_spam {
        app.storage.insert_spam_message(&record, None)?;
    } else {
        app.storage.insert_ham_message(&record, None)?;
    }
    Ok(format!(
        "Learned as {}.",
        if is_spam { "spam" } else { "ham" }
    ))
}

/// Train both the chat model and the shared global model.
fn learn_text(
    app: &App,
    chat_id: i64,
    settings: &ResolvedSettings,
    text: &str,
    is_spam: bool,
) -> Result<()> {
    app.spam.learn(text, is_spam, Some(chat_id), settings.locale())?;
    app.spam.learn(text, is_spam, None, settings.locale())?;
    Ok(())
}

fn unlearn_text(
    app: &App,
    chat_id: i64,
    settings: &ResolvedSettings,
    text: &str,
    is_spam: bool,
) -> Result<()> {
    app.spam.unlearn(text, is_spam, Some(chat_id), settings.locale())?;
    app.spam.unlearn(text, is_spam, None, settings.locale())?;
    Ok(())
}

fn spam_score(app: &App, event: &IncomingEvent, settings: &ResolvedSettings) -> Result<String> {
    let target = replied_message(app, event)?;
    let score = app
        .spam
        .score(&target.text, Some(event.chat.chat_id), settings.locale())?;
    Ok(format!(
        "Spam score: {score:.3} (threshold {:.2})",
        settings.spam_score_threshold()
    ))
}

/// Reverse a ban: unban on the platform, clear the spammer flag, move the
/// user's spam examples to ham (reason `unban`) and unlearn them.
async fn unban(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
    args: &str,
) -> Result<String> {
    let chat_id = event.chat.chat_id;
    let user_id = match (replied_message(app, event), args.trim()) {
        (Ok(target), _) => target.user_id,
        (Err(_), handle) if !handle.is_empty() => {
            let handle = handle.trim_start_matches('@');
            app.storage
                .list_chat_members(chat_id, None)?
                .into_iter()
                .find(|member| member.username.as_deref() == Some(handle))
                .map(|member| member.user_id)
                .ok_or_else(|| {
                    BotError::Validation(format!("No user @{handle} seen in this chat."))
                })?
        }
        _ => {
            return Err(BotError::Validation(
                "Reply to the user's message or pass @username.".to_string(),
            ))
        }
    };

    if let Err(e) = app
        .platform(&event.platform)?
        .outbound
        .unban_user(chat_id, user_id)
        .await
    {
        warn!(chat = chat_id, user = user_id, error = %e, "platform unban failed");
    }
    app.storage.set_spammer_flag(chat_id, user_id, false, None)?;

    let spam_rows: Vec<SpamRecord> = app
        .storage
        .spam_messages_for_chat(chat_id, None)?
        .into_iter()
        .filter(|r| r.user_id == user_id)
        .collect();
    for row in &spam_rows {
        unlearn_text(app, chat_id, settings, &row.text, true)?;
        app.storage.delete_spam_message(chat_id, &row.message_id, None)?;
        app.storage.insert_ham_message(
            &SpamRecord {
                reason: SpamReason::Unban,
                score: 0.0,
                ..row.clone()
            },
            None,
        )?;
    }
    Ok(format!(
        "Unbanned; reverted {} spam label(s).",
        spam_rows.len()
    ))
}

/// Bulk-train the Bayes model from stored history: labeled spam rows as
/// spam, regular messages from non-flagged users as ham.
fn pretrain(
    app: &App,
    event: &IncomingEvent,
    settings: &ResolvedSettings,
    args: &str,
) -> Result<String> {
    let chat_id: i64 = match args.trim() {
        "" => event.chat.chat_id,
        other => other
            .parse()
            .map_err(|_| BotError::Validation("usage: /pretrain_bayes [chat-id]".to_string()))?,
    };

    let mut spam_count = 0usize;
    for record in app.storage.spam_messages_for_chat(chat_id, None)? {
        learn_text(app, chat_id, settings, &record.text, true)?;
        spam_count += 1;
    }

    let mut ham_count = 0usize;
    let members = app.storage.list_chat_members(chat_id, None)?;
    let spammers: Vec<i64> = members
        .iter()
        .filter(|m| m.is_spammer)
        .map(|m| m.user_id)
        .collect();
    for message in app.storage.recent_messages(chat_id, 0, 500, None)? {
        if message.category == MessageCategory::User
            && !spammers.contains(&message.user_id)
            && !message.text.is_empty()
        {
            learn_text(app, chat_id, settings, &message.text, false)?;
            ham_count += 1;
        }
    }
    Ok(format!(
        "Pretrained on {spam_count} spam and {ham_count} ham messages."
    ))
}

fn models(app: &App) -> String {
    let mut out = String::from("Configured model bindings:\n");
    for (id, binding) in app.dispatcher.list_bindings() {
        out.push_str(&format!(
            "  {id}: {:?} {} ctx={} tools={} vision={}{}\n",
            binding.kind,
            binding.model_id,
            binding.context_size,
            binding.supports_tools,
            binding.supports_vision,
            binding
                .fallback
                .as_ref()
                .map(|f| format!(" fallback={f}"))
                .unwrap_or_default(),
        ));
    }
    out
}

fn replied_message(app: &App, event: &IncomingEvent) -> Result<StoredMessage> {
    let reply_to = event
        .message
        .as_ref()
        .and_then(|m| m.reply_to.as_ref())
        .ok_or_else(|| BotError::Validation("This command works as a reply.".to_string()))?;
    Ok(app.storage.get_message(event.chat.chat_id, reply_to, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_parses() {
        let parsed = parse_command("/echo hello dood").unwrap();
        assert_eq!(parsed.name, "echo");
        assert_eq!(parsed.bot, None);
        assert_eq!(parsed.args, "hello dood");
    }

    #[test]
    fn bot_suffix_is_split_off() {
        let parsed = parse_command("/set@govorun_bot detect-spam true").unwrap();
        assert_eq!(parsed.name, "set");
        assert_eq!(parsed.bot.as_deref(), Some("govorun_bot"));
        assert_eq!(parsed.args, "detect-spam true");
    }

    #[test]
    fn bare_command_has_empty_args() {
        let parsed = parse_command("/help").unwrap();
        assert_eq!(parsed.name, "help");
        assert_eq!(parsed.args, "");
    }

    #[test]
    fn name_is_lowercased() {
        assert_eq!(parse_command("/Help").unwrap().name, "help");
    }

    #[test]
    fn non_commands_do_not_parse() {
        assert!(parse_command("hello").is_none());
        assert!(parse_command("/").is_none());
        assert!(parse_command("/привет").is_none());
    }

    #[test]
    fn admin_gates_cover_the_spam_commands() {
        for name in ["spam", "learn_spam", "learn_ham", "get_spam_score", "unban", "pretrain_bayes", "set", "unset", "configure", "settings"] {
            assert!(requires_admin(name), "{name} must be admin-gated");
        }
        assert!(!requires_admin("weather"));
        assert!(requires_owner("models"));
        assert!(!requires_owner("settings"));
    }
}
