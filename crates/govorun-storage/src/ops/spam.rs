//! Spam/ham example storage and the Bayes counter tables.
//!
//! All Bayes updates for one message run inside a single transaction so the
//! per-chat aggregate counters always equal the sum of the per-token counters.
//! The global model is stored under `chat_id = 0`.

use std::collections::HashMap;
use std::str::FromStr;

use rusqlite::params;

use crate::error::{Result, StorageError};
use crate::source::SqliteSource;
use crate::types::{
    BayesClassCounts, BayesTokenCounts, MessageCategory, SpamReason, SpamRecord,
};

/// Sentinel chat id for the global Bayes model.
pub const GLOBAL_MODEL: i64 = 0;

impl SqliteSource {
    pub fn insert_spam_message(&self, record: &SpamRecord) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            insert_labeled(conn, "spam_messages", record)?;
            Ok(())
        })
    }

    pub fn insert_ham_message(&self, record: &SpamRecord) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            insert_labeled(conn, "ham_messages", record)?;
            Ok(())
        })
    }

    pub fn delete_spam_message(&self, chat_id: i64, message_id: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM spam_messages WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id, message_id],
            )?;
            Ok(())
        })
    }

    /// Labeled spam examples of one chat.
    pub fn spam_messages_for_chat(&self, chat_id: i64) -> Result<Vec<SpamRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, user_id, message_id, text, reason, score
                 FROM spam_messages WHERE chat_id = ?1 ORDER BY message_id",
            )?;
            let rows = stmt.query_map([chat_id], row_to_record)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// All labeled spam examples of this source.
    pub fn all_spam_messages(&self) -> Result<Vec<SpamRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chat_id, user_id, message_id, text, reason, score
                 FROM spam_messages ORDER BY chat_id, message_id",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Atomically reclassify a message as `user-spam`, record the spam
    /// example and flag the sender. One transaction keeps the message
    /// category and its `spam_messages` sibling consistent.
    pub fn mark_message_spam(&self, record: &SpamRecord) -> Result<()> {
        self.check_writable()?;
        self.with_txn(|txn| {
            let n = txn.execute(
                "UPDATE messages SET category = ?3 WHERE chat_id = ?1 AND message_id = ?2",
                params![
                    record.chat_id,
                    record.message_id,
                    MessageCategory::UserSpam.as_str()
                ],
            )?;
            if n == 0 {
                return Err(StorageError::NotFound(format!(
                    "message ({}, {})",
                    record.chat_id, record.message_id
                )));
            }
            txn.execute(
                "INSERT INTO spam_messages (chat_id, user_id, message_id, text, reason, score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (chat_id, message_id) DO UPDATE SET
                     reason = excluded.reason, score = excluded.score",
                params![
                    record.chat_id,
                    record.user_id,
                    record.message_id,
                    record.text,
                    record.reason.as_str(),
                    record.score,
                ],
            )?;
            txn.execute(
                "UPDATE chat_users SET is_spammer = 1 WHERE chat_id = ?1 AND user_id = ?2",
                params![record.chat_id, record.user_id],
            )?;
            Ok(())
        })
    }

    /// Apply one message's token counts to the model of `chat_id`
    /// (GLOBAL_MODEL for the shared model). `sign` is +1 for learn and -1
    /// for unlearn; counters floor at zero on decrement.
    pub fn bayes_apply(
        &self,
        chat_id: i64,
        is_spam: bool,
        token_counts: &[(String, i64)],
        sign: i64,
    ) -> Result<()> {
        self.check_writable()?;
        let total_tokens: i64 = token_counts.iter().map(|(_, n)| n).sum();
        self.with_txn(|txn| {
            let column = if is_spam { "spam_count" } else { "ham_count" };
            for (token, count) in token_counts {
                let delta = count * sign;
                txn.execute(
                    &format!(
                        "INSERT INTO bayes_tokens (token, chat_id, {column})
                         VALUES (?1, ?2, MAX(0, ?3))
                         ON CONFLICT (token, chat_id) DO UPDATE SET
                             {column} = MAX(0, {column} + ?3)"
                    ),
                    params![token, chat_id, delta],
                )?;
            }
            txn.execute(
                "INSERT INTO bayes_classes (chat_id, is_spam, message_count, token_count)
                 VALUES (?1, ?2, MAX(0, ?3), MAX(0, ?4))
                 ON CONFLICT (chat_id, is_spam) DO UPDATE SET
                     message_count = MAX(0, message_count + ?3),
                     token_count = MAX(0, token_count + ?4)",
                params![chat_id, is_spam, sign, total_tokens * sign],
            )?;
            Ok(())
        })
    }

    /// Per-token spam/ham counters for the given tokens. Missing tokens are
    /// simply absent from the returned map.
    pub fn bayes_token_counts(
        &self,
        chat_id: i64,
        tokens: &[String],
    ) -> Result<HashMap<String, BayesTokenCounts>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT spam_count, ham_count FROM bayes_tokens WHERE token = ?1 AND chat_id = ?2",
            )?;
            let mut out = HashMap::with_capacity(tokens.len());
            for token in tokens {
                let counts = stmt
                    .query_row(params![token, chat_id], |r| {
                        Ok(BayesTokenCounts {
                            spam_count: r.get(0)?,
                            ham_count: r.get(1)?,
                        })
                    })
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(BayesTokenCounts::default()),
                        other => Err(other),
                    })?;
                if counts.spam_count > 0 || counts.ham_count > 0 {
                    out.insert(token.clone(), counts);
                }
            }
            Ok(out)
        })
    }

    /// `(spam, ham)` aggregate counters for one model.
    pub fn bayes_class_counts(&self, chat_id: i64) -> Result<(BayesClassCounts, BayesClassCounts)> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT message_count, token_count FROM bayes_classes
                 WHERE chat_id = ?1 AND is_spam = ?2",
            )?;
            let mut load = |is_spam: bool| {
                stmt.query_row(params![chat_id, is_spam], |r| {
                    Ok(BayesClassCounts {
                        message_count: r.get(0)?,
                        token_count: r.get(1)?,
                    })
                })
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(BayesClassCounts::default()),
                    other => Err(other),
                })
            };
            let spam = load(true)?;
            let ham = load(false)?;
            Ok((spam, ham))
        })
    }

    /// Number of distinct tokens known to one model (the V in smoothing).
    pub fn bayes_vocabulary_size(&self, chat_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM bayes_tokens
                 WHERE chat_id = ?1 AND (spam_count > 0 OR ham_count > 0)",
                [chat_id],
                |r| r.get(0),
            )?)
        })
    }

    /// Sum of one class's token counters, used to audit the class aggregate.
    pub fn bayes_token_sum(&self, chat_id: i64, is_spam: bool) -> Result<i64> {
        let column = if is_spam { "spam_count" } else { "ham_count" };
        self.with_conn(|conn| {
            Ok(conn.query_row(
                &format!("SELECT COALESCE(SUM({column}), 0) FROM bayes_tokens WHERE chat_id = ?1"),
                [chat_id],
                |r| r.get(0),
            )?)
        })
    }
}

fn insert_labeled(
    conn: &rusqlite::Connection,
    table: &str,
    record: &SpamRecord,
) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO {table} (chat_id, user_id, message_id, text, reason, score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (chat_id, message_id) DO UPDATE SET
                 reason = excluded.reason, score = excluded.score"
        ),
        params![
            record.chat_id,
            record.user_id,
            record.message_id,
            record.text,
            record.reason.as_str(),
            record.score,
        ],
    )
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpamRecord> {
    let reason_str: String = row.get(4)?;
    Ok(SpamRecord {
        chat_id: row.get(0)?,
        user_id: row.get(1)?,
        message_id: row.get(2)?,
        text: row.get(3)?,
        reason: SpamReason::from_str(&reason_str).unwrap_or(SpamReason::Auto),
        score: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{open_migrated, test_message};
    use crate::types::ChatUser;

    fn record(chat_id: i64, message_id: &str) -> SpamRecord {
        SpamRecord {
            chat_id,
            user_id: 42,
            message_id: message_id.to_string(),
            text: "BUY NOW".to_string(),
            reason: SpamReason::Auto,
            score: 0.93,
        }
    }

    #[test]
    fn mark_spam_is_atomic_and_flags_sender() {
        let (_dir, src) = open_migrated();
        src.upsert_chat_user(&ChatUser::new(-100, 42, "x", None))
            .unwrap();
        src.save_message(&test_message(-100, "m1", 42, "BUY NOW"))
            .unwrap();

        src.mark_message_spam(&record(-100, "m1")).unwrap();

        // P1: user-spam category implies a sibling spam_messages row.
        assert_eq!(
            src.get_message(-100, "m1").unwrap().category,
            MessageCategory::UserSpam
        );
        let rows = src.spam_messages_for_chat(-100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reason, SpamReason::Auto);
        assert!(src.get_chat_user(-100, 42).unwrap().is_spammer);
    }

    #[test]
    fn mark_spam_missing_message_has_no_side_effect() {
        let (_dir, src) = open_migrated();
        assert!(matches!(
            src.mark_message_spam(&record(-100, "ghost")),
            Err(StorageError::NotFound(_))
        ));
        assert!(src.spam_messages_for_chat(-100).unwrap().is_empty());
    }

    #[test]
    fn bayes_learn_then_unlearn_restores_counters() {
        let (_dir, src) = open_migrated();
        let tokens = vec![("buy".to_string(), 2), ("now".to_string(), 1)];

        src.bayes_apply(GLOBAL_MODEL, true, &tokens, 1).unwrap();
        let (spam, _) = src.bayes_class_counts(GLOBAL_MODEL).unwrap();
        assert_eq!(spam.message_count, 1);
        assert_eq!(spam.token_count, 3);
        assert_eq!(src.bayes_token_sum(GLOBAL_MODEL, true).unwrap(), 3);

        src.bayes_apply(GLOBAL_MODEL, true, &tokens, -1).unwrap();
        let (spam, ham) = src.bayes_class_counts(GLOBAL_MODEL).unwrap();
        assert_eq!(spam.message_count, 0);
        assert_eq!(spam.token_count, 0);
        assert_eq!(ham.message_count, 0);
        assert_eq!(src.bayes_token_sum(GLOBAL_MODEL, true).unwrap(), 0);
    }

    #[test]
    fn bayes_aggregate_matches_token_sum() {
        let (_dir, src) = open_migrated();
        src.bayes_apply(-100, true, &[("a".to_string(), 3)], 1).unwrap();
        src.bayes_apply(-100, true, &[("b".to_string(), 2)], 1).unwrap();
        src.bayes_apply(-100, false, &[("a".to_string(), 1)], 1).unwrap();

        // P2 on the storage layer.
        let (spam, ham) = src.bayes_class_counts(-100).unwrap();
        assert_eq!(spam.token_count, src.bayes_token_sum(-100, true).unwrap());
        assert_eq!(ham.token_count, src.bayes_token_sum(-100, false).unwrap());
        assert_eq!(src.bayes_vocabulary_size(-100).unwrap(), 2);
    }

    #[test]
    fn unlearn_floors_at_zero() {
        let (_dir, src) = open_migrated();
        src.bayes_apply(GLOBAL_MODEL, false, &[("x".to_string(), 1)], 1)
            .unwrap();
        // Unlearning more than was learned must not go negative.
        src.bayes_apply(GLOBAL_MODEL, false, &[("x".to_string(), 5)], -1)
            .unwrap();
        let counts = src
            .bayes_token_counts(GLOBAL_MODEL, &["x".to_string()])
            .unwrap();
        assert!(counts.is_empty());
        let (_, ham) = src.bayes_class_counts(GLOBAL_MODEL).unwrap();
        assert_eq!(ham.token_count, 0);
    }
}
