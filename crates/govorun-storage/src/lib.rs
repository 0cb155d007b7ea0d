pub mod error;
pub mod migrate;
pub mod ops;
pub mod router;
pub mod source;
pub mod types;

pub use error::{Result, StorageError};
pub use ops::spam::GLOBAL_MODEL;
pub use router::StorageRouter;
pub use source::SqliteSource;

#[cfg(test)]
pub(crate) mod test_util {
    use govorun_core::config::SourceConfig;

    use crate::migrate::run_migrations;
    use crate::source::SqliteSource;
    use crate::types::{MessageCategory, MessageType, StoredMessage};

    /// A migrated read-write source on a temp file.
    pub fn open_migrated() -> (tempfile::TempDir, SqliteSource) {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open(
            "main",
            &SourceConfig {
                path: dir.path().join("test.db").to_string_lossy().into_owned(),
                readonly: false,
                pool_size: 2,
                timeout: 1,
            },
        )
        .unwrap();
        run_migrations(&src).unwrap();
        (dir, src)
    }

    pub fn test_message(chat_id: i64, message_id: &str, user_id: i64, text: &str) -> StoredMessage {
        StoredMessage {
            chat_id,
            message_id: message_id.to_string(),
            date: 1_700_000_000,
            user_id,
            reply_id: None,
            thread_id: 0,
            root_message_id: None,
            text: text.to_string(),
            message_type: MessageType::Text,
            category: MessageCategory::User,
            quote: None,
            media_id: None,
            media_group_id: None,
            markup: None,
            metadata: None,
        }
    }
}
