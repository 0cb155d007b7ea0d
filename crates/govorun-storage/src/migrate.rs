//! Versioned linear migrations.
//!
//! The current schema version lives in `global_settings['db-migration-version']`.
//! Each migration carries apply and rollback SQL; an apply runs inside one
//! transaction and a failure reverts it, leaving the recorded version
//! untouched. Read-only sources are never migrated — a version mismatch there
//! is logged and reads proceed against whatever schema the file has.

use rusqlite::Transaction;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::source::SqliteSource;

pub const MIGRATION_VERSION_KEY: &str = "db-migration-version";

pub struct Migration {
    pub version: u32,
    pub apply: &'static str,
    pub rollback: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        apply: "
            CREATE TABLE chats (
                chat_id INTEGER PRIMARY KEY,
                kind    TEXT NOT NULL,
                title   TEXT NOT NULL DEFAULT '',
                flags   INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE chat_users (
                chat_id       INTEGER NOT NULL,
                user_id       INTEGER NOT NULL,
                display_name  TEXT NOT NULL DEFAULT '',
                username      TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                metadata      TEXT NOT NULL DEFAULT '{}',
                is_spammer    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, user_id)
            );
            CREATE TABLE messages (
                chat_id        INTEGER NOT NULL,
                message_id     TEXT NOT NULL,
                date           INTEGER NOT NULL,
                user_id        INTEGER NOT NULL,
                reply_id       TEXT,
                thread_id      INTEGER NOT NULL DEFAULT 0,
                root_message_id TEXT,
                text           TEXT NOT NULL DEFAULT '',
                type           TEXT NOT NULL DEFAULT 'text',
                category       TEXT NOT NULL DEFAULT 'unspecified',
                quote          TEXT,
                media_id       TEXT,
                media_group_id TEXT,
                markup         TEXT,
                metadata       TEXT,
                PRIMARY KEY (chat_id, message_id)
            );
            CREATE INDEX idx_messages_chat_date ON messages (chat_id, thread_id, date);
            CREATE TABLE chat_settings (
                chat_id INTEGER NOT NULL,
                key     TEXT NOT NULL,
                value   TEXT NOT NULL,
                PRIMARY KEY (chat_id, key)
            );
            CREATE TABLE global_settings (
                key   TEXT NOT NULL PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE user_data (
                user_id INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                key     TEXT NOT NULL,
                value   TEXT NOT NULL,
                PRIMARY KEY (user_id, chat_id, key)
            );
        ",
        rollback: "
            DROP TABLE IF EXISTS user_data;
            DROP TABLE IF EXISTS global_settings;
            DROP TABLE IF EXISTS chat_settings;
            DROP TABLE IF EXISTS messages;
            DROP TABLE IF EXISTS chat_users;
            DROP TABLE IF EXISTS chats;
        ",
    },
    Migration {
        version: 2,
        apply: "
            CREATE TABLE media_attachments (
                file_unique_id TEXT NOT NULL PRIMARY KEY,
                status         TEXT NOT NULL DEFAULT 'new',
                mime           TEXT NOT NULL DEFAULT '',
                size           INTEGER NOT NULL DEFAULT 0,
                local_url      TEXT,
                file_id        TEXT NOT NULL DEFAULT '',
                description    TEXT,
                prompt         TEXT
            );
            CREATE TABLE media_groups (
                media_group_id TEXT NOT NULL,
                media_id       TEXT NOT NULL,
                chat_id        INTEGER NOT NULL,
                message_id     TEXT NOT NULL,
                updated_at     INTEGER NOT NULL,
                processed      INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (media_group_id, media_id)
            );
            CREATE INDEX idx_media_groups_pending ON media_groups (processed, updated_at);
        ",
        rollback: "
            DROP TABLE IF EXISTS media_groups;
            DROP TABLE IF EXISTS media_attachments;
        ",
    },
    Migration {
        version: 3,
        apply: "
            CREATE TABLE spam_messages (
                chat_id    INTEGER NOT NULL,
                user_id    INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                text       TEXT NOT NULL DEFAULT '',
                reason     TEXT NOT NULL,
                score      REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, message_id)
            );
            CREATE TABLE ham_messages (
                chat_id    INTEGER NOT NULL,
                user_id    INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                text       TEXT NOT NULL DEFAULT '',
                reason     TEXT NOT NULL,
                score      REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, message_id)
            );
            -- chat_id 0 holds the global model.
            CREATE TABLE bayes_tokens (
                token      TEXT NOT NULL,
                chat_id    INTEGER NOT NULL DEFAULT 0,
                spam_count INTEGER NOT NULL DEFAULT 0,
                ham_count  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (token, chat_id)
            );
            CREATE TABLE bayes_classes (
                chat_id       INTEGER NOT NULL,
                is_spam       INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                token_count   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, is_spam)
            );
        ",
        rollback: "
            DROP TABLE IF EXISTS bayes_classes;
            DROP TABLE IF EXISTS bayes_tokens;
            DROP TABLE IF EXISTS ham_messages;
            DROP TABLE IF EXISTS spam_messages;
        ",
    },
    Migration {
        version: 4,
        apply: "
            CREATE TABLE cache_storage (
                namespace   TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                ttl_secs    INTEGER,
                persistence TEXT NOT NULL DEFAULT 'on-change',
                PRIMARY KEY (namespace, key)
            );
            CREATE TABLE api_cache (
                domain    TEXT NOT NULL,
                key       TEXT NOT NULL,
                value     TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (domain, key)
            );
            CREATE TABLE summaries (
                csid       TEXT NOT NULL PRIMARY KEY,
                summary    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        ",
        rollback: "
            DROP TABLE IF EXISTS summaries;
            DROP TABLE IF EXISTS api_cache;
            DROP TABLE IF EXISTS cache_storage;
        ",
    },
    Migration {
        version: 5,
        apply: "
            CREATE TABLE delayed_tasks (
                id       TEXT NOT NULL PRIMARY KEY,
                fire_at  INTEGER NOT NULL,
                function TEXT NOT NULL,
                kwargs   TEXT NOT NULL DEFAULT '{}',
                is_done  INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_delayed_tasks_due ON delayed_tasks (is_done, fire_at);
            CREATE TABLE daily_stats (
                chat_id INTEGER NOT NULL,
                date    TEXT NOT NULL,
                count   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, date)
            );
            CREATE TABLE user_daily_stats (
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                date    TEXT NOT NULL,
                count   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, user_id, date)
            );
        ",
        rollback: "
            DROP TABLE IF EXISTS user_daily_stats;
            DROP TABLE IF EXISTS daily_stats;
            DROP TABLE IF EXISTS delayed_tasks;
        ",
    },
];

/// Bring `source` up to the latest schema version.
pub fn run_migrations(source: &SqliteSource) -> Result<()> {
    let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    let current = current_version(source)?;

    if source.is_readonly() {
        if current != latest {
            warn!(
                source = source.name(),
                current, latest, "read-only source is behind the latest schema"
            );
        }
        return Ok(());
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        source
            .with_txn(|txn| {
                txn.execute_batch(migration.apply)?;
                record_version(txn, migration.version)?;
                Ok(())
            })
            .map_err(|e| StorageError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        info!(
            source = source.name(),
            version = migration.version,
            "migration applied"
        );
    }
    Ok(())
}

/// Roll the schema back to `target_version` (inclusive lower bound).
pub fn rollback_to(source: &SqliteSource, target_version: u32) -> Result<()> {
    source.check_writable()?;
    let current = current_version(source)?;
    for migration in MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version <= current && m.version > target_version)
    {
        source
            .with_txn(|txn| {
                txn.execute_batch(migration.rollback)?;
                record_version(txn, migration.version - 1)?;
                Ok(())
            })
            .map_err(|e| StorageError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        info!(
            source = source.name(),
            version = migration.version,
            "migration rolled back"
        );
    }
    Ok(())
}

fn current_version(source: &SqliteSource) -> Result<u32> {
    source.with_conn(|conn| {
        let table_exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'global_settings')",
            [],
            |r| r.get(0),
        )?;
        if !table_exists {
            return Ok(0);
        }
        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM global_settings WHERE key = ?1",
                [MIGRATION_VERSION_KEY],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
    })
}

fn record_version(txn: &Transaction, version: u32) -> Result<()> {
    txn.execute(
        "INSERT INTO global_settings (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        rusqlite::params![MIGRATION_VERSION_KEY, version.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use govorun_core::config::SourceConfig;

    fn open_temp() -> (tempfile::TempDir, SqliteSource) {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open(
            "main",
            &SourceConfig {
                path: dir.path().join("m.db").to_string_lossy().into_owned(),
                readonly: false,
                pool_size: 1,
                timeout: 1,
            },
        )
        .unwrap();
        (dir, src)
    }

    #[test]
    fn migrations_are_linear_and_versioned() {
        let mut prev = 0;
        for m in MIGRATIONS {
            assert_eq!(m.version, prev + 1, "migration versions must be contiguous");
            prev = m.version;
        }
    }

    #[test]
    fn fresh_db_migrates_to_latest() {
        let (_dir, src) = open_temp();
        run_migrations(&src).unwrap();
        let version = current_version(&src).unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);

        // Re-running is a no-op.
        run_migrations(&src).unwrap();
        assert_eq!(current_version(&src).unwrap(), version);
    }

    #[test]
    fn rollback_reverts_schema_and_version() {
        let (_dir, src) = open_temp();
        run_migrations(&src).unwrap();
        rollback_to(&src, 3).unwrap();
        assert_eq!(current_version(&src).unwrap(), 3);

        // Tables from v4/v5 are gone, v3 tables remain.
        let exists = |name: &str| -> bool {
            src.with_conn(|c| {
                Ok(c.query_row(
                    "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE name = ?1)",
                    [name],
                    |r| r.get(0),
                )?)
            })
            .unwrap()
        };
        assert!(!exists("cache_storage"));
        assert!(!exists("delayed_tasks"));
        assert!(exists("bayes_tokens"));

        // And migrating again restores the latest schema.
        run_migrations(&src).unwrap();
        assert!(exists("delayed_tasks"));
    }
}
