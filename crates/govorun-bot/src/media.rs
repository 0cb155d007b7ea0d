//! Media-group completion cron and the resender jobs.
//!
//! Albums arrive as independent messages sharing a `media_group_id` with no
//! closing marker. Every tick scans unprocessed groups; a group is complete
//! once its newest member has sat quiet for the job's
//! `media_group_delay_secs`. Complete groups are handled as one batch;
//! stragglers arriving later land in a fresh group row and are treated as
//! new single-item albums.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use govorun_channels::types::OutgoingMedia;
use govorun_core::config::ResenderJob;
use govorun_storage::types::{MessageCategory, MessageType, StoredMessage};

use crate::app::App;

const TICK: Duration = Duration::from_secs(1);
const DEFAULT_GROUP_DELAY_SECS: u64 = 5;

/// Is the group old enough to be treated as complete?
pub fn group_complete(now: i64, newest_member_at: i64, delay_secs: u64) -> bool {
    now - newest_member_at >= delay_secs as i64
}

fn delay_for_chat(jobs: &[ResenderJob], chat_id: i64) -> u64 {
    jobs.iter()
        .find(|job| job.source_chat_id == chat_id)
        .map(|job| job.media_group_delay_secs)
        .unwrap_or(DEFAULT_GROUP_DELAY_SECS)
}

pub async fn run_media_cron(app: Arc<App>, mut shutdown: watch::Receiver<bool>) {
    info!("media cron started");
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => tick(&app).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("media cron shutting down");
                    break;
                }
            }
        }
    }
}

/// One scan pass. Errors are contained per group; the cron never dies.
async fn tick(app: &App) {
    let groups = match app.storage.unprocessed_groups() {
        Ok(groups) => groups,
        Err(e) => {
            warn!(error = %e, "media group scan failed");
            return;
        }
    };
    let now = chrono::Utc::now().timestamp();
    let jobs = &app.config.resender.jobs;

    for (group_id, chat_id, newest_at) in groups {
        let delay = delay_for_chat(jobs, chat_id);
        if !group_complete(now, newest_at, delay) {
            continue;
        }
        if let Err(e) = process_group(app, &group_id, chat_id).await {
            warn!(group = %group_id, chat = chat_id, error = %e, "media group processing failed");
        }
    }
}

async fn process_group(app: &App, group_id: &str, chat_id: i64) -> crate::error::Result<()> {
    let members = app.storage.group_members(group_id, chat_id, None)?;
    // Mark first: a crash mid-send must not replay the album forever.
    app.storage.mark_group_processed(group_id, chat_id, None)?;
    info!(group = %group_id, chat = chat_id, size = members.len(), "media group complete");

    let Some(job) = app
        .config
        .resender
        .jobs
        .iter()
        .find(|job| job.source_chat_id == chat_id)
    else {
        return Ok(());
    };

    // Republish the whole album into the target chat as one batch.
    let mut media = Vec::with_capacity(members.len());
    for member in &members {
        let attachment = app.storage.get_attachment(&member.media_id, None)?;
        let caption = app
            .storage
            .get_message(chat_id, &member.message_id, None)
            .map(|m| m.text)
            .unwrap_or_default();
        media.push(OutgoingMedia::FileId {
            file_id: attachment.file_id,
            caption,
        });
    }
    if media.is_empty() {
        return Ok(());
    }

    // Resender jobs stay within one platform; members carry no platform, so
    // the job's source chat decides: whichever adapter saw the group.
    let platform_name = app
        .platforms
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "telegram".to_string());
    let platform = app.platform(&platform_name)?;
    app.limiter
        .admit(&format!("{platform_name}-send"), None, None)
        .await
        .map_err(|e| crate::error::BotError::Internal(e.to_string()))?;
    let sent = platform
        .outbound
        .send_media_group(job.target_chat_id, 0, &media)
        .await?;

    // Persist the republished copies.
    let now = chrono::Utc::now().timestamp();
    for (message, member) in sent.iter().zip(&members) {
        let stored = StoredMessage {
            chat_id: job.target_chat_id,
            message_id: message.message_id.clone(),
            date: now,
            user_id: platform.bot_user_id,
            reply_id: None,
            thread_id: 0,
            root_message_id: None,
            text: String::new(),
            message_type: MessageType::Photo,
            category: MessageCategory::BotResended,
            quote: None,
            media_id: Some(member.media_id.clone()),
            media_group_id: Some(format!("resend-{group_id}")),
            markup: None,
            metadata: None,
        };
        if let Err(e) = app.storage.save_message(&stored, None) {
            warn!(chat = job.target_chat_id, error = %e, "resend persist failed");
        }
    }
    info!(
        job = %job.id,
        source = chat_id,
        target = job.target_chat_id,
        items = media.len(),
        "album republished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(source: i64, delay: u64) -> ResenderJob {
        ResenderJob {
            id: "job-1".to_string(),
            source_chat_id: source,
            target_chat_id: -200,
            media_group_delay_secs: delay,
        }
    }

    #[test]
    fn group_needs_quiet_period() {
        // Members at t=0,1,2; delay 5. At t=3 the newest is 1s old: defer.
        assert!(!group_complete(3, 2, 5));
        // At t=8 the newest is 6s old: complete.
        assert!(group_complete(8, 2, 5));
        // Exactly at the boundary counts as complete.
        assert!(group_complete(7, 2, 5));
    }

    #[test]
    fn single_item_group_completes_after_delay() {
        assert!(!group_complete(4, 0, 5));
        assert!(group_complete(5, 0, 5));
    }

    #[test]
    fn delay_comes_from_the_matching_job() {
        let jobs = vec![job(-100, 12)];
        assert_eq!(delay_for_chat(&jobs, -100), 12);
        assert_eq!(delay_for_chat(&jobs, -999), DEFAULT_GROUP_DELAY_SECS);
    }
}
