use std::str::FromStr;

use rusqlite::{params, Transaction};

use crate::error::{Result, StorageError};
use crate::source::SqliteSource;
use crate::types::{MessageCategory, MessageType, StoredMessage};

impl SqliteSource {
    /// Persist a message and bump the sender's counters in one transaction:
    /// the chat-user message count plus the per-chat and per-user daily stats.
    pub fn save_message(&self, msg: &StoredMessage) -> Result<()> {
        self.check_writable()?;
        self.with_txn(|txn| {
            insert_message(txn, msg)?;
            let date = chrono::DateTime::from_timestamp(msg.date, 0)
                .unwrap_or_default()
                .format("%Y-%m-%d")
                .to_string();
            txn.execute(
                "UPDATE chat_users SET message_count = message_count + 1
                 WHERE chat_id = ?1 AND user_id = ?2",
                params![msg.chat_id, msg.user_id],
            )?;
            txn.execute(
                "INSERT INTO daily_stats (chat_id, date, count) VALUES (?1, ?2, 1)
                 ON CONFLICT (chat_id, date) DO UPDATE SET count = count + 1",
                params![msg.chat_id, date],
            )?;
            txn.execute(
                "INSERT INTO user_daily_stats (chat_id, user_id, date, count) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT (chat_id, user_id, date) DO UPDATE SET count = count + 1",
                params![msg.chat_id, msg.user_id, date],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, chat_id: i64, message_id: &str) -> Result<StoredMessage> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 AND message_id = ?2"),
                params![chat_id, message_id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::NotFound(format!("message ({chat_id}, {message_id})"))
                }
                other => other.into(),
            })
        })
    }

    /// Latest `limit` messages of a chat thread, oldest first.
    pub fn recent_messages(
        &self,
        chat_id: i64,
        thread_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND thread_id = ?2
                 ORDER BY date DESC, message_id DESC LIMIT ?3",
            ))?;
            let rows = stmt.query_map(params![chat_id, thread_id, limit], row_to_message)?;
            let mut msgs: Vec<_> = rows.filter_map(|r| r.ok()).collect();
            msgs.reverse();
            Ok(msgs)
        })
    }

    /// All messages of one logical conversation, oldest first.
    pub fn conversation_messages(
        &self,
        chat_id: i64,
        root_message_id: &str,
    ) -> Result<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND (root_message_id = ?2 OR message_id = ?2)
                 ORDER BY date, message_id",
            ))?;
            let rows = stmt.query_map(params![chat_id, root_message_id], row_to_message)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Reclassify a stored message. The only expected upgrade path is
    /// `user → user-spam`; the caller owns that policy.
    pub fn set_message_category(
        &self,
        chat_id: i64,
        message_id: &str,
        category: MessageCategory,
    ) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET category = ?3 WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id, message_id, category.as_str()],
            )?;
            if n == 0 {
                return Err(StorageError::NotFound(format!(
                    "message ({chat_id}, {message_id})"
                )));
            }
            Ok(())
        })
    }

    pub fn daily_message_count(&self, chat_id: i64, date: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM daily_stats WHERE chat_id = ?1 AND date = ?2",
                    params![chat_id, date],
                    |r| r.get(0),
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(0),
                    other => Err(other),
                })?;
            Ok(count)
        })
    }

    pub fn user_daily_message_count(&self, chat_id: i64, user_id: i64, date: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM user_daily_stats
                     WHERE chat_id = ?1 AND user_id = ?2 AND date = ?3",
                    params![chat_id, user_id, date],
                    |r| r.get(0),
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(0),
                    other => Err(other),
                })?;
            Ok(count)
        })
    }
}

const MESSAGE_COLUMNS: &str = "chat_id, message_id, date, user_id, reply_id, thread_id, \
     root_message_id, text, type, category, quote, media_id, media_group_id, markup, metadata";

pub(crate) fn insert_message(txn: &Transaction, msg: &StoredMessage) -> Result<()> {
    txn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT (chat_id, message_id) DO UPDATE SET
                 text = excluded.text, category = excluded.category, markup = excluded.markup,
                 metadata = excluded.metadata"
        ),
        params![
            msg.chat_id,
            msg.message_id,
            msg.date,
            msg.user_id,
            msg.reply_id,
            msg.thread_id,
            msg.root_message_id,
            msg.text,
            msg.message_type.to_string(),
            msg.category.as_str(),
            msg.quote,
            msg.media_id,
            msg.media_group_id,
            msg.markup.as_ref().map(|v| v.to_string()),
            msg.metadata.as_ref().map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let type_str: String = row.get(8)?;
    let category_str: String = row.get(9)?;
    let markup: Option<String> = row.get(13)?;
    let metadata: Option<String> = row.get(14)?;
    Ok(StoredMessage {
        chat_id: row.get(0)?,
        message_id: row.get(1)?,
        date: row.get(2)?,
        user_id: row.get(3)?,
        reply_id: row.get(4)?,
        thread_id: row.get(5)?,
        root_message_id: row.get(6)?,
        text: row.get(7)?,
        message_type: MessageType::from_str(&type_str).unwrap_or(MessageType::Other),
        category: MessageCategory::from_str(&category_str).unwrap_or(MessageCategory::Unspecified),
        quote: row.get(10)?,
        media_id: row.get(11)?,
        media_group_id: row.get(12)?,
        markup: markup.and_then(|s| serde_json::from_str(&s).ok()),
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{open_migrated, test_message};
    use crate::types::ChatUser;

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        let msg = test_message(-100, "m1", 42, "hello dood");
        src.save_message(&msg).unwrap();

        let loaded = src.get_message(-100, "m1").unwrap();
        assert_eq!(loaded.text, "hello dood");
        assert_eq!(loaded.category, MessageCategory::User);
        assert_eq!(loaded.thread_id, 0);
    }

    #[test]
    fn save_bumps_counters() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        let msg = test_message(-100, "m1", 42, "a");
        src.save_message(&msg).unwrap();
        src.save_message(&test_message(-100, "m2", 42, "b")).unwrap();

        assert_eq!(src.get_chat_user(-100, 42).unwrap().message_count, 2);
        let date = chrono::DateTime::from_timestamp(msg.date, 0)
            .unwrap()
            .format("%Y-%m-%d")
            .to_string();
        assert_eq!(src.daily_message_count(-100, &date).unwrap(), 2);
        assert_eq!(src.user_daily_message_count(-100, 42, &date).unwrap(), 2);
    }

    #[test]
    fn recent_messages_oldest_first() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
            let mut msg = test_message(-100, id, 42, id);
            msg.date += i as i64;
            src.save_message(&msg).unwrap();
        }
        let msgs = src.recent_messages(-100, 0, 2).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].message_id, "m2");
        assert_eq!(msgs[1].message_id, "m3");
    }

    #[test]
    fn category_upgrade() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        src.save_message(&test_message(-100, "m1", 42, "spam text"))
            .unwrap();
        src.set_message_category(-100, "m1", MessageCategory::UserSpam)
            .unwrap();
        assert_eq!(
            src.get_message(-100, "m1").unwrap().category,
            MessageCategory::UserSpam
        );
    }

    #[test]
    fn conversation_includes_root_and_children() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        src.save_message(&test_message(-100, "root", 42, "head"))
            .unwrap();
        let mut child = test_message(-100, "c1", 42, "tail");
        child.date += 1;
        child.root_message_id = Some("root".to_string());
        src.save_message(&child).unwrap();

        let conv = src.conversation_messages(-100, "root").unwrap();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].message_id, "root");
    }
}
