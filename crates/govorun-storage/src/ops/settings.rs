use rusqlite::params;

use crate::error::{Result, StorageError};
use crate::source::SqliteSource;

impl SqliteSource {
    pub fn set_chat_setting(&self, chat_id: i64, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_settings (chat_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (chat_id, key) DO UPDATE SET value = excluded.value",
                params![chat_id, key, value],
            )?;
            Ok(())
        })
    }

    pub fn get_chat_setting(&self, chat_id: i64, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM chat_settings WHERE chat_id = ?1 AND key = ?2",
                params![chat_id, key],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other.into()),
            })
        })
    }

    pub fn unset_chat_setting(&self, chat_id: i64, key: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM chat_settings WHERE chat_id = ?1 AND key = ?2",
                params![chat_id, key],
            )?;
            if n == 0 {
                return Err(StorageError::NotFound(format!(
                    "setting {key} for chat {chat_id}"
                )));
            }
            Ok(())
        })
    }

    /// All stored settings of a chat as `(key, value)` pairs.
    pub fn all_chat_settings(&self, chat_id: i64) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM chat_settings WHERE chat_id = ?1 ORDER BY key")?;
            let rows = stmt.query_map([chat_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn set_global_setting(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO global_settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    pub fn get_global_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM global_settings WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other.into()),
            })
        })
    }

    /// Handler-scoped scratch value, keyed `(user, chat, key)`.
    pub fn set_user_data(&self, user_id: i64, chat_id: i64, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_data (user_id, chat_id, key, value) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id, chat_id, key) DO UPDATE SET value = excluded.value",
                params![user_id, chat_id, key, value],
            )?;
            Ok(())
        })
    }

    pub fn get_user_data(&self, user_id: i64, chat_id: i64, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM user_data WHERE user_id = ?1 AND chat_id = ?2 AND key = ?3",
                params![user_id, chat_id, key],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other.into()),
            })
        })
    }

    pub fn delete_user_data(&self, user_id: i64, chat_id: i64, key: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM user_data WHERE user_id = ?1 AND chat_id = ?2 AND key = ?3",
                params![user_id, chat_id, key],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::StorageError;
    use crate::test_util::open_migrated;

    #[test]
    fn chat_setting_set_get_unset() {
        let (_dir, src) = open_migrated();
        src.set_chat_setting(-100, "detect-spam", "true").unwrap();
        assert_eq!(
            src.get_chat_setting(-100, "detect-spam").unwrap(),
            Some("true".to_string())
        );

        src.set_chat_setting(-100, "detect-spam", "false").unwrap();
        assert_eq!(
            src.get_chat_setting(-100, "detect-spam").unwrap(),
            Some("false".to_string())
        );

        src.unset_chat_setting(-100, "detect-spam").unwrap();
        assert_eq!(src.get_chat_setting(-100, "detect-spam").unwrap(), None);
        assert!(matches!(
            src.unset_chat_setting(-100, "detect-spam"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn global_settings_round_trip() {
        let (_dir, src) = open_migrated();
        src.set_global_setting("announcement", "hi").unwrap();
        assert_eq!(
            src.get_global_setting("announcement").unwrap(),
            Some("hi".to_string())
        );
        assert_eq!(src.get_global_setting("missing").unwrap(), None);
    }

    #[test]
    fn user_data_scoped_by_chat() {
        let (_dir, src) = open_migrated();
        src.set_user_data(42, -100, "wizard-step", "2").unwrap();
        src.set_user_data(42, -200, "wizard-step", "5").unwrap();
        assert_eq!(
            src.get_user_data(42, -100, "wizard-step").unwrap(),
            Some("2".to_string())
        );
        assert_eq!(
            src.get_user_data(42, -200, "wizard-step").unwrap(),
            Some("5".to_string())
        );
        src.delete_user_data(42, -100, "wizard-step").unwrap();
        assert_eq!(src.get_user_data(42, -100, "wizard-step").unwrap(), None);
    }
}
