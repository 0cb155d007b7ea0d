use std::str::FromStr;

use rusqlite::params;

use crate::error::{Result, StorageError};
use crate::source::SqliteSource;
use crate::types::{MediaAttachment, MediaGroupMember, MediaStatus};

impl SqliteSource {
    pub fn upsert_attachment(&self, media: &MediaAttachment) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO media_attachments
                     (file_unique_id, status, mime, size, local_url, file_id, description, prompt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (file_unique_id) DO UPDATE SET
                     mime = excluded.mime, size = excluded.size, file_id = excluded.file_id",
                params![
                    media.file_unique_id,
                    media.status.as_str(),
                    media.mime,
                    media.size,
                    media.local_url,
                    media.file_id,
                    media.description,
                    media.prompt,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_attachment(&self, file_unique_id: &str) -> Result<MediaAttachment> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT file_unique_id, status, mime, size, local_url, file_id, description, prompt
                 FROM media_attachments WHERE file_unique_id = ?1",
                [file_unique_id],
                row_to_attachment,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::NotFound(format!("media {file_unique_id}"))
                }
                other => other.into(),
            })
        })
    }

    /// Advance the attachment state machine. Rejects non-monotone moves
    /// (`done` and `failed` are terminal) with `Conflict`.
    pub fn set_attachment_status(&self, file_unique_id: &str, status: MediaStatus) -> Result<()> {
        self.check_writable()?;
        let current = self.get_attachment(file_unique_id)?.status;
        if !current.can_transition_to(status) {
            return Err(StorageError::Conflict(format!(
                "media {file_unique_id}: illegal transition {current} -> {status}"
            )));
        }
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE media_attachments SET status = ?2 WHERE file_unique_id = ?1",
                params![file_unique_id, status.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn set_attachment_description(&self, file_unique_id: &str, description: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE media_attachments SET description = ?2 WHERE file_unique_id = ?1",
                params![file_unique_id, description],
            )?;
            Ok(())
        })
    }

    pub fn set_attachment_local_url(&self, file_unique_id: &str, local_url: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE media_attachments SET local_url = ?2 WHERE file_unique_id = ?1",
                params![file_unique_id, local_url],
            )?;
            Ok(())
        })
    }

    /// Upsert one member of an album, refreshing its `updated_at` clock.
    /// There is no closure signal for albums; the media cron decides
    /// completeness from the age of the newest member.
    pub fn upsert_group_member(&self, member: &MediaGroupMember) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO media_groups
                     (media_group_id, media_id, chat_id, message_id, updated_at, processed)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)
                 ON CONFLICT (media_group_id, media_id) DO UPDATE SET
                     updated_at = excluded.updated_at",
                params![
                    member.media_group_id,
                    member.media_id,
                    member.chat_id,
                    member.message_id,
                    member.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Unprocessed groups with the age of their newest member:
    /// `(media_group_id, chat_id, max_updated_at)`.
    pub fn unprocessed_groups(&self) -> Result<Vec<(String, i64, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT media_group_id, chat_id, MAX(updated_at) FROM media_groups
                 WHERE processed = 0 GROUP BY media_group_id, chat_id",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn group_members(&self, media_group_id: &str) -> Result<Vec<MediaGroupMember>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT media_group_id, media_id, chat_id, message_id, updated_at, processed
                 FROM media_groups WHERE media_group_id = ?1 ORDER BY message_id",
            )?;
            let rows = stmt.query_map([media_group_id], |r| {
                Ok(MediaGroupMember {
                    media_group_id: r.get(0)?,
                    media_id: r.get(1)?,
                    chat_id: r.get(2)?,
                    message_id: r.get(3)?,
                    updated_at: r.get(4)?,
                    processed: r.get(5)?,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn mark_group_processed(&self, media_group_id: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE media_groups SET processed = 1 WHERE media_group_id = ?1",
                [media_group_id],
            )?;
            Ok(())
        })
    }
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaAttachment> {
    let status_str: String = row.get(1)?;
    Ok(MediaAttachment {
        file_unique_id: row.get(0)?,
        status: MediaStatus::from_str(&status_str).unwrap_or(MediaStatus::New),
        mime: row.get(2)?,
        size: row.get(3)?,
        local_url: row.get(4)?,
        file_id: row.get(5)?,
        description: row.get(6)?,
        prompt: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_migrated;

    fn attachment(id: &str) -> MediaAttachment {
        MediaAttachment {
            file_unique_id: id.to_string(),
            status: MediaStatus::New,
            mime: "image/jpeg".to_string(),
            size: 1024,
            local_url: None,
            file_id: format!("file-{id}"),
            description: None,
            prompt: None,
        }
    }

    #[test]
    fn attachment_status_is_monotone() {
        let (_dir, src) = open_migrated();
        src.upsert_attachment(&attachment("a1")).unwrap();
        src.set_attachment_status("a1", MediaStatus::Pending).unwrap();
        src.set_attachment_status("a1", MediaStatus::Done).unwrap();

        // done is terminal
        assert!(matches!(
            src.set_attachment_status("a1", MediaStatus::Pending),
            Err(StorageError::Conflict(_))
        ));
        // new cannot jump straight to done
        src.upsert_attachment(&attachment("a2")).unwrap();
        assert!(matches!(
            src.set_attachment_status("a2", MediaStatus::Done),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn group_age_is_newest_member() {
        let (_dir, src) = open_migrated();
        for (i, media_id) in ["p1", "p2", "p3"].iter().enumerate() {
            src.upsert_group_member(&MediaGroupMember {
                media_group_id: "G".to_string(),
                media_id: media_id.to_string(),
                chat_id: -100,
                message_id: format!("m{i}"),
                updated_at: 1000 + i as i64,
                processed: false,
            })
            .unwrap();
        }
        let groups = src.unprocessed_groups().unwrap();
        assert_eq!(groups, vec![("G".to_string(), -100, 1002)]);

        src.mark_group_processed("G").unwrap();
        assert!(src.unprocessed_groups().unwrap().is_empty());
        assert_eq!(src.group_members("G").unwrap().len(), 3);
    }
}
