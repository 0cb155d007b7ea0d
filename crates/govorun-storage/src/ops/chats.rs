use std::str::FromStr;

use rusqlite::params;

use crate::error::{Result, StorageError};
use crate::source::SqliteSource;
use crate::types::{Chat, ChatKind, ChatUser};

impl SqliteSource {
    /// Insert or refresh a chat row. Chats are created lazily on first observation.
    pub fn upsert_chat(&self, chat: &Chat) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chats (chat_id, kind, title, flags) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (chat_id) DO UPDATE SET
                     kind = excluded.kind, title = excluded.title, flags = excluded.flags",
                params![chat.chat_id, chat.kind.to_string(), chat.title, chat.flags],
            )?;
            Ok(())
        })
    }

    pub fn get_chat(&self, chat_id: i64) -> Result<Chat> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT chat_id, kind, title, flags FROM chats WHERE chat_id = ?1",
                [chat_id],
                row_to_chat,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::NotFound(format!("chat {chat_id}"))
                }
                other => other.into(),
            })
        })
    }

    pub fn list_chats(&self) -> Result<Vec<Chat>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT chat_id, kind, title, flags FROM chats ORDER BY chat_id")?;
            let rows = stmt.query_map([], row_to_chat)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn upsert_chat_user(&self, user: &ChatUser) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_users
                     (chat_id, user_id, display_name, username, message_count, metadata, is_spammer)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (chat_id, user_id) DO UPDATE SET
                     display_name = excluded.display_name,
                     username = excluded.username",
                params![
                    user.chat_id,
                    user.user_id,
                    user.display_name,
                    user.username,
                    user.message_count,
                    user.metadata.to_string(),
                    user.is_spammer,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_chat_user(&self, chat_id: i64, user_id: i64) -> Result<ChatUser> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT chat_id, user_id, display_name, username, message_count, metadata, is_spammer
                 FROM chat_users WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
                row_to_chat_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::NotFound(format!("chat user ({chat_id}, {user_id})"))
                }
                other => other.into(),
            })
        })
    }

    pub fn set_spammer_flag(&self, chat_id: i64, user_id: i64, is_spammer: bool) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE chat_users SET is_spammer = ?3 WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id, is_spammer],
            )?;
            if n == 0 {
                return Err(StorageError::NotFound(format!(
                    "chat user ({chat_id}, {user_id})"
                )));
            }
            Ok(())
        })
    }

    pub fn set_chat_user_metadata(
        &self,
        chat_id: i64,
        user_id: i64,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chat_users SET metadata = ?3 WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id, metadata.to_string()],
            )?;
            Ok(())
        })
    }

    /// All `(user, chat)` memberships of one user in this source.
    pub fn list_user_chats(&self, user_id: i64) -> Result<Vec<ChatUser>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, user_id, display_name, username, message_count, metadata, is_spammer
                 FROM chat_users WHERE user_id = ?1 ORDER BY chat_id",
            )?;
            let rows = stmt.query_map([user_id], row_to_chat_user)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn list_chat_members(&self, chat_id: i64) -> Result<Vec<ChatUser>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, user_id, display_name, username, message_count, metadata, is_spammer
                 FROM chat_users WHERE chat_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt.query_map([chat_id], row_to_chat_user)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let kind_str: String = row.get(1)?;
    Ok(Chat {
        chat_id: row.get(0)?,
        kind: ChatKind::from_str(&kind_str).unwrap_or(ChatKind::Group),
        title: row.get(2)?,
        flags: row.get(3)?,
    })
}

pub(crate) fn row_to_chat_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatUser> {
    let metadata_str: String = row.get(5)?;
    Ok(ChatUser {
        chat_id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        username: row.get(3)?,
        message_count: row.get(4)?,
        metadata: serde_json::from_str(&metadata_str)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        is_spammer: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_migrated;

    #[test]
    fn chat_lifecycle() {
        let (_dir, src) = open_migrated();
        let chat = Chat {
            chat_id: -100,
            kind: ChatKind::Group,
            title: "test group".to_string(),
            flags: 0,
        };
        src.upsert_chat(&chat).unwrap();
        let loaded = src.get_chat(-100).unwrap();
        assert_eq!(loaded.title, "test group");
        assert_eq!(loaded.kind, ChatKind::Group);

        assert!(matches!(src.get_chat(1), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn chat_user_upsert_preserves_counters() {
        let (_dir, src) = open_migrated();
        let mut user = ChatUser::new(-100, 42, "Dood", Some("dood"));
        user.message_count = 7;
        src.upsert_chat_user(&user).unwrap();

        // A second upsert (new display name) must not clobber the counter.
        let refreshed = ChatUser::new(-100, 42, "Dood Renamed", Some("dood"));
        src.upsert_chat_user(&refreshed).unwrap();

        let loaded = src.get_chat_user(-100, 42).unwrap();
        assert_eq!(loaded.display_name, "Dood Renamed");
        assert_eq!(loaded.message_count, 7);
    }

    #[test]
    fn spammer_flag_round_trip() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        src.set_spammer_flag(-100, 42, true).unwrap();
        assert!(src.get_chat_user(-100, 42).unwrap().is_spammer);
    }

    #[test]
    fn user_chats_lists_memberships() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        src.upsert_chat_user(&ChatUser::new(-200, 42, "x", None))
            .unwrap();
        src.upsert_chat_user(&ChatUser::new(-100, 43, "y", None))
            .unwrap();
        let chats = src.list_user_chats(42).unwrap();
        assert_eq!(chats.len(), 2);
    }
}
