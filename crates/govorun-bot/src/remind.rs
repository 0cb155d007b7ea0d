//! /remind parsing and the `notify` task handler.
//!
//! Reminders are delayed tasks with ids derived from the commanding message,
//! so re-delivery of the same command cannot double-schedule. The `notify`
//! handler only needs the outboxes, which keeps the scheduler registry free
//! of any reference back into the app.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::warn;

use govorun_channels::types::OutgoingAction;
use govorun_channels::Outbox;
use govorun_scheduler::TaskRegistry;

use crate::app::App;
use crate::error::{BotError, Result};

/// Parse the `<when>` argument of /remind into an absolute unix timestamp.
///
/// Accepted forms: `30s`, `10m`, `2h`, `1d`, a bare number (minutes), or
/// `HH:MM` (today, or tomorrow when that time already passed).
pub fn parse_when(input: &str, now: DateTime<Utc>) -> Option<i64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Some((hour, minute)) = input.split_once(':') {
        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        let mut at = now.date_naive().and_time(time).and_utc();
        if at <= now {
            at += Duration::days(1);
        }
        return Some(at.timestamp());
    }

    let (digits, unit) = match input.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((split, _)) => input.split_at(split),
        None => (input, "m"),
    };
    let amount: i64 = digits.parse().ok()?;
    if amount <= 0 {
        return None;
    }
    let seconds = match unit {
        "s" => amount,
        "m" | "min" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86_400,
        _ => return None,
    };
    Some((now + Duration::seconds(seconds)).timestamp())
}

/// The /remind command body.
pub fn command(
    app: &App,
    event: &govorun_channels::types::IncomingEvent,
    args: &str,
) -> Result<String> {
    let (when, text) = match args.split_once(char::is_whitespace) {
        Some((when, text)) => (when, text.trim()),
        None => (args, ""),
    };
    let now = Utc::now();
    let fire_at = parse_when(when, now).ok_or_else(|| {
        BotError::Validation("usage: /remind <when> [text] — e.g. /remind 10m tea".to_string())
    })?;
    let text = if text.is_empty() { "Reminder!" } else { text };

    let message_id = event
        .message
        .as_ref()
        .map(|m| m.message_id.as_str())
        .unwrap_or("0");
    let id = format!("remind-{}-{}", event.chat.chat_id, message_id);
    let kwargs = serde_json::json!({
        "platform": event.platform,
        "chat_id": event.chat.chat_id,
        "topic_id": event.chat.topic_id,
        "text": text,
    });
    let created = app.scheduler.schedule(&id, fire_at, "notify", kwargs)?;
    let delta = fire_at - now.timestamp();
    Ok(if created {
        format!("Reminder set: \"{text}\" in {}.", human_delta(delta))
    } else {
        "This reminder is already scheduled.".to_string()
    })
}

fn human_delta(seconds: i64) -> String {
    match seconds {
        s if s < 90 => format!("{s}s"),
        s if s < 5400 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d", s / 86_400),
    }
}

/// Register the scheduler's task handlers. Handlers capture only the
/// outboxes; unknown platforms at fire time are logged and dropped.
pub fn register_task_handlers(registry: &mut TaskRegistry, outboxes: HashMap<String, Outbox>) {
    registry.register("notify", move |kwargs| {
        let outboxes = outboxes.clone();
        Box::pin(async move {
            let platform = kwargs
                .get("platform")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let chat_id = kwargs.get("chat_id").and_then(|v| v.as_i64()).unwrap_or(0);
            let topic_id = kwargs.get("topic_id").and_then(|v| v.as_i64()).unwrap_or(0);
            let text = kwargs
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("Reminder!")
                .to_string();

            let Some(outbox) = outboxes.get(&platform) else {
                warn!(platform = %platform, "notify task for unknown platform");
                return Err(format!("unknown platform: {platform}"));
            };
            outbox
                .submit(OutgoingAction::SendText {
                    chat_id,
                    topic_id,
                    text,
                    reply_to: None,
                })
                .await
                .map_err(|e| e.to_string())
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn relative_units_parse() {
        let now = base();
        assert_eq!(parse_when("30s", now), Some(now.timestamp() + 30));
        assert_eq!(parse_when("10m", now), Some(now.timestamp() + 600));
        assert_eq!(parse_when("2h", now), Some(now.timestamp() + 7200));
        assert_eq!(parse_when("1d", now), Some(now.timestamp() + 86_400));
    }

    #[test]
    fn bare_number_means_minutes() {
        let now = base();
        assert_eq!(parse_when("5", now), Some(now.timestamp() + 300));
    }

    #[test]
    fn clock_time_today_or_tomorrow() {
        let now = base(); // 12:00
        let this_evening = parse_when("18:30", now).unwrap();
        assert_eq!(this_evening - now.timestamp(), 6 * 3600 + 1800);

        let next_morning = parse_when("09:00", now).unwrap();
        assert_eq!(next_morning - now.timestamp(), 21 * 3600);
    }

    #[test]
    fn garbage_is_rejected() {
        let now = base();
        assert_eq!(parse_when("", now), None);
        assert_eq!(parse_when("soonish", now), None);
        assert_eq!(parse_when("-5m", now), None);
        assert_eq!(parse_when("25:99", now), None);
    }

    #[test]
    fn human_delta_buckets() {
        assert_eq!(human_delta(45), "45s");
        assert_eq!(human_delta(600), "10m");
        assert_eq!(human_delta(7260), "2h 1m");
        assert_eq!(human_delta(200_000), "2d");
    }
}
