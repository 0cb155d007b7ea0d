//! Multi-source storage router.
//!
//! Exposes the union of the entity operations with source routing on top.
//! Resolution order for every call: the explicit `source` hint, then the
//! configured `chat_id → source` mapping (for chat-scoped operations), then
//! the default source. Cross-source reads probe every source, skip the ones
//! that fail (with a warning) and deduplicate per the operation's key.
//!
//! The router itself is stateless; each source owns its connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use govorun_core::config::DatabaseConfig;

use crate::error::{Result, StorageError};
use crate::migrate::run_migrations;
use crate::ops::spam::GLOBAL_MODEL;
use crate::source::SqliteSource;
use crate::types::{
    ApiCacheRow, BayesClassCounts, BayesTokenCounts, CacheRow, Chat, ChatUser, DelayedTask,
    MediaAttachment, MediaGroupMember, MediaStatus, MessageCategory, SpamRecord, StoredMessage,
};

pub struct StorageRouter {
    sources: HashMap<String, Arc<SqliteSource>>,
    /// Probe order for aggregation: default source first, the rest sorted by name.
    probe_order: Vec<String>,
    default: String,
    chat_mapping: HashMap<i64, String>,
}

impl StorageRouter {
    /// Open every configured source and migrate the writable ones.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let mut sources = HashMap::new();
        for (name, source_config) in &config.sources {
            let source = SqliteSource::open(name, source_config)?;
            run_migrations(&source)?;
            sources.insert(name.clone(), Arc::new(source));
        }
        if !sources.contains_key(&config.default) {
            return Err(StorageError::UnknownSource(config.default.clone()));
        }
        let chat_mapping = config
            .chat_mapping_parsed()
            .map_err(|e| StorageError::UnknownSource(e.to_string()))?;

        let mut probe_order: Vec<String> = sources
            .keys()
            .filter(|n| **n != config.default)
            .cloned()
            .collect();
        probe_order.sort();
        probe_order.insert(0, config.default.clone());

        Ok(Self {
            sources,
            probe_order,
            default: config.default.clone(),
            chat_mapping,
        })
    }

    /// Resolve an explicit hint or fall back to the default source.
    pub fn source(&self, hint: Option<&str>) -> Result<&Arc<SqliteSource>> {
        let name = hint.unwrap_or(&self.default);
        self.sources
            .get(name)
            .ok_or_else(|| StorageError::UnknownSource(name.to_string()))
    }

    /// Resolve a chat-scoped operation: hint → chat mapping → default.
    pub fn source_for_chat(&self, chat_id: i64, hint: Option<&str>) -> Result<&Arc<SqliteSource>> {
        if let Some(name) = hint {
            return self.source(Some(name));
        }
        if let Some(name) = self.chat_mapping.get(&chat_id) {
            return self.source(Some(name));
        }
        self.source(None)
    }

    pub fn source_names(&self) -> &[String] {
        &self.probe_order
    }

    fn each_source(&self) -> impl Iterator<Item = &Arc<SqliteSource>> {
        self.probe_order.iter().filter_map(|n| self.sources.get(n))
    }

    // --- chats & users ------------------------------------------------------

    pub fn upsert_chat(&self, chat: &Chat, source: Option<&str>) -> Result<()> {
        self.source_for_chat(chat.chat_id, source)?.upsert_chat(chat)
    }

    pub fn get_chat(&self, chat_id: i64, source: Option<&str>) -> Result<Chat> {
        self.source_for_chat(chat_id, source)?.get_chat(chat_id)
    }

    /// All chats across every source, deduplicated by `chat_id`.
    pub fn list_all_chats(&self) -> Result<Vec<Chat>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for source in self.each_source() {
            match source.list_chats() {
                Ok(chats) => {
                    for chat in chats {
                        if seen.insert(chat.chat_id) {
                            out.push(chat);
                        }
                    }
                }
                Err(e) => warn!(source = source.name(), error = %e, "list_chats failed; skipping source"),
            }
        }
        Ok(out)
    }

    pub fn upsert_chat_user(&self, user: &ChatUser, source: Option<&str>) -> Result<()> {
        self.source_for_chat(user.chat_id, source)?.upsert_chat_user(user)
    }

    pub fn get_chat_user(&self, chat_id: i64, user_id: i64, source: Option<&str>) -> Result<ChatUser> {
        self.source_for_chat(chat_id, source)?.get_chat_user(chat_id, user_id)
    }

    pub fn set_spammer_flag(
        &self,
        chat_id: i64,
        user_id: i64,
        is_spammer: bool,
        source: Option<&str>,
    ) -> Result<()> {
        self.source_for_chat(chat_id, source)?
            .set_spammer_flag(chat_id, user_id, is_spammer)
    }

    pub fn set_chat_user_metadata(
        &self,
        chat_id: i64,
        user_id: i64,
        metadata: &serde_json::Value,
        source: Option<&str>,
    ) -> Result<()> {
        self.source_for_chat(chat_id, source)?
            .set_chat_user_metadata(chat_id, user_id, metadata)
    }

    /// All `(user, chat)` memberships across sources, deduplicated by
    /// `(user_id, chat_id)`.
    pub fn list_user_chats(&self, user_id: i64) -> Result<Vec<ChatUser>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for source in self.each_source() {
            match source.list_user_chats(user_id) {
                Ok(rows) => {
                    for row in rows {
                        if seen.insert((row.user_id, row.chat_id)) {
                            out.push(row);
                        }
                    }
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "list_user_chats failed; skipping source")
                }
            }
        }
        Ok(out)
    }

    pub fn list_chat_members(&self, chat_id: i64, source: Option<&str>) -> Result<Vec<ChatUser>> {
        self.source_for_chat(chat_id, source)?.list_chat_members(chat_id)
    }

    // --- messages -----------------------------------------------------------

    pub fn save_message(&self, msg: &StoredMessage, source: Option<&str>) -> Result<()> {
        self.source_for_chat(msg.chat_id, source)?.save_message(msg)
    }

    pub fn get_message(
        &self,
        chat_id: i64,
        message_id: &str,
        source: Option<&str>,
    ) -> Result<StoredMessage> {
        self.source_for_chat(chat_id, source)?.get_message(chat_id, message_id)
    }

    pub fn recent_messages(
        &self,
        chat_id: i64,
        thread_id: i64,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<StoredMessage>> {
        self.source_for_chat(chat_id, source)?
            .recent_messages(chat_id, thread_id, limit)
    }

    pub fn conversation_messages(
        &self,
        chat_id: i64,
        root_message_id: &str,
        source: Option<&str>,
    ) -> Result<Vec<StoredMessage>> {
        self.source_for_chat(chat_id, source)?
            .conversation_messages(chat_id, root_message_id)
    }

    pub fn set_message_category(
        &self,
        chat_id: i64,
        message_id: &str,
        category: MessageCategory,
        source: Option<&str>,
    ) -> Result<()> {
        self.source_for_chat(chat_id, source)?
            .set_message_category(chat_id, message_id, category)
    }

    pub fn daily_message_count(&self, chat_id: i64, date: &str, source: Option<&str>) -> Result<i64> {
        self.source_for_chat(chat_id, source)?.daily_message_count(chat_id, date)
    }

    pub fn user_daily_message_count(
        &self,
        chat_id: i64,
        user_id: i64,
        date: &str,
        source: Option<&str>,
    ) -> Result<i64> {
        self.source_for_chat(chat_id, source)?
            .user_daily_message_count(chat_id, user_id, date)
    }

    // --- settings & user data ----------------------------------------------

    pub fn set_chat_setting(
        &self,
        chat_id: i64,
        key: &str,
        value: &str,
        source: Option<&str>,
    ) -> Result<()> {
        self.source_for_chat(chat_id, source)?.set_chat_setting(chat_id, key, value)
    }

    pub fn get_chat_setting(
        &self,
        chat_id: i64,
        key: &str,
        source: Option<&str>,
    ) -> Result<Option<String>> {
        self.source_for_chat(chat_id, source)?.get_chat_setting(chat_id, key)
    }

    pub fn unset_chat_setting(&self, chat_id: i64, key: &str, source: Option<&str>) -> Result<()> {
        self.source_for_chat(chat_id, source)?.unset_chat_setting(chat_id, key)
    }

    pub fn all_chat_settings(
        &self,
        chat_id: i64,
        source: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        self.source_for_chat(chat_id, source)?.all_chat_settings(chat_id)
    }

    pub fn set_global_setting(&self, key: &str, value: &str, source: Option<&str>) -> Result<()> {
        self.source(source)?.set_global_setting(key, value)
    }

    pub fn get_global_setting(&self, key: &str, source: Option<&str>) -> Result<Option<String>> {
        self.source(source)?.get_global_setting(key)
    }

    pub fn set_user_data(
        &self,
        user_id: i64,
        chat_id: i64,
        key: &str,
        value: &str,
        source: Option<&str>,
    ) -> Result<()> {
        self.source_for_chat(chat_id, source)?
            .set_user_data(user_id, chat_id, key, value)
    }

    pub fn get_user_data(
        &self,
        user_id: i64,
        chat_id: i64,
        key: &str,
        source: Option<&str>,
    ) -> Result<Option<String>> {
        self.source_for_chat(chat_id, source)?.get_user_data(user_id, chat_id, key)
    }

    pub fn delete_user_data(
        &self,
        user_id: i64,
        chat_id: i64,
        key: &str,
        source: Option<&str>,
    ) -> Result<()> {
        self.source_for_chat(chat_id, source)?
            .delete_user_data(user_id, chat_id, key)
    }

    // --- media --------------------------------------------------------------

    pub fn upsert_attachment(&self, media: &MediaAttachment, source: Option<&str>) -> Result<()> {
        self.source(source)?.upsert_attachment(media)
    }

    pub fn get_attachment(&self, file_unique_id: &str, source: Option<&str>) -> Result<MediaAttachment> {
        self.source(source)?.get_attachment(file_unique_id)
    }

    pub fn set_attachment_status(
        &self,
        file_unique_id: &str,
        status: MediaStatus,
        source: Option<&str>,
    ) -> Result<()> {
        self.source(source)?.set_attachment_status(file_unique_id, status)
    }

    pub fn set_attachment_description(
        &self,
        file_unique_id: &str,
        description: &str,
        source: Option<&str>,
    ) -> Result<()> {
        self.source(source)?
            .set_attachment_description(file_unique_id, description)
    }

    pub fn set_attachment_local_url(
        &self,
        file_unique_id: &str,
        local_url: &str,
        source: Option<&str>,
    ) -> Result<()> {
        self.source(source)?.set_attachment_local_url(file_unique_id, local_url)
    }

    pub fn upsert_group_member(&self, member: &MediaGroupMember, source: Option<&str>) -> Result<()> {
        self.source_for_chat(member.chat_id, source)?.upsert_group_member(member)
    }

    /// Unprocessed media groups across all sources.
    pub fn unprocessed_groups(&self) -> Result<Vec<(String, i64, i64)>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for source in self.each_source() {
            match source.unprocessed_groups() {
                Ok(groups) => {
                    for group in groups {
                        if seen.insert(group.0.clone()) {
                            out.push(group);
                        }
                    }
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "unprocessed_groups failed; skipping source")
                }
            }
        }
        Ok(out)
    }

    pub fn group_members(
        &self,
        media_group_id: &str,
        chat_id: i64,
        source: Option<&str>,
    ) -> Result<Vec<MediaGroupMember>> {
        self.source_for_chat(chat_id, source)?.group_members(media_group_id)
    }

    pub fn mark_group_processed(
        &self,
        media_group_id: &str,
        chat_id: i64,
        source: Option<&str>,
    ) -> Result<()> {
        self.source_for_chat(chat_id, source)?.mark_group_processed(media_group_id)
    }

    // --- spam & Bayes -------------------------------------------------------

    pub fn insert_spam_message(&self, record: &SpamRecord, source: Option<&str>) -> Result<()> {
        self.source_for_chat(record.chat_id, source)?.insert_spam_message(record)
    }

    pub fn insert_ham_message(&self, record: &SpamRecord, source: Option<&str>) -> Result<()> {
        self.source_for_chat(record.chat_id, source)?.insert_ham_message(record)
    }

    pub fn delete_spam_message(&self, chat_id: i64, message_id: &str, source: Option<&str>) -> Result<()> {
        self.source_for_chat(chat_id, source)?.delete_spam_message(chat_id, message_id)
    }

    pub fn mark_message_spam(&self, record: &SpamRecord, source: Option<&str>) -> Result<()> {
        self.source_for_chat(record.chat_id, source)?.mark_message_spam(record)
    }

    pub fn spam_messages_for_chat(&self, chat_id: i64, source: Option<&str>) -> Result<Vec<SpamRecord>> {
        self.source_for_chat(chat_id, source)?.spam_messages_for_chat(chat_id)
    }

    /// Spam examples across every source, deduplicated by `(chat_id, message_id)`.
    pub fn all_spam_messages(&self) -> Result<Vec<SpamRecord>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for source in self.each_source() {
            match source.all_spam_messages() {
                Ok(rows) => {
                    for row in rows {
                        if seen.insert((row.chat_id, row.message_id.clone())) {
                            out.push(row);
                        }
                    }
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "all_spam_messages failed; skipping source")
                }
            }
        }
        Ok(out)
    }

    /// `chat_id = None` addresses the global model.
    pub fn bayes_apply(
        &self,
        chat_id: Option<i64>,
        is_spam: bool,
        token_counts: &[(String, i64)],
        sign: i64,
        source: Option<&str>,
    ) -> Result<()> {
        self.bayes_source(chat_id, source)?
            .bayes_apply(chat_id.unwrap_or(GLOBAL_MODEL), is_spam, token_counts, sign)
    }

    pub fn bayes_token_counts(
        &self,
        chat_id: Option<i64>,
        tokens: &[String],
        source: Option<&str>,
    ) -> Result<HashMap<String, BayesTokenCounts>> {
        self.bayes_source(chat_id, source)?
            .bayes_token_counts(chat_id.unwrap_or(GLOBAL_MODEL), tokens)
    }

    pub fn bayes_class_counts(
        &self,
        chat_id: Option<i64>,
        source: Option<&str>,
    ) -> Result<(BayesClassCounts, BayesClassCounts)> {
        self.bayes_source(chat_id, source)?
            .bayes_class_counts(chat_id.unwrap_or(GLOBAL_MODEL))
    }

    pub fn bayes_vocabulary_size(&self, chat_id: Option<i64>, source: Option<&str>) -> Result<i64> {
        self.bayes_source(chat_id, source)?
            .bayes_vocabulary_size(chat_id.unwrap_or(GLOBAL_MODEL))
    }

    pub fn bayes_token_sum(
        &self,
        chat_id: Option<i64>,
        is_spam: bool,
        source: Option<&str>,
    ) -> Result<i64> {
        self.bayes_source(chat_id, source)?
            .bayes_token_sum(chat_id.unwrap_or(GLOBAL_MODEL), is_spam)
    }

    fn bayes_source(&self, chat_id: Option<i64>, hint: Option<&str>) -> Result<&Arc<SqliteSource>> {
        match chat_id {
            Some(id) => self.source_for_chat(id, hint),
            None => self.source(hint),
        }
    }

    // --- delayed tasks ------------------------------------------------------

    pub fn schedule_task(&self, task: &DelayedTask, source: Option<&str>) -> Result<bool> {
        self.source(source)?.schedule_task(task)
    }

    pub fn get_task(&self, id: &str, source: Option<&str>) -> Result<DelayedTask> {
        self.source(source)?.get_task(id)
    }

    pub fn due_tasks(&self, now: i64, source: Option<&str>) -> Result<Vec<DelayedTask>> {
        self.source(source)?.due_tasks(now)
    }

    pub fn set_task_done(&self, id: &str, source: Option<&str>) -> Result<()> {
        self.source(source)?.set_task_done(id)
    }

    // --- cache backing ------------------------------------------------------

    pub fn cache_upsert(&self, row: &CacheRow, source: Option<&str>) -> Result<()> {
        self.source(source)?.cache_upsert(row)
    }

    pub fn cache_get(&self, namespace: &str, key: &str, source: Option<&str>) -> Result<Option<CacheRow>> {
        self.source(source)?.cache_get(namespace, key)
    }

    pub fn cache_delete(&self, namespace: &str, key: &str, source: Option<&str>) -> Result<()> {
        self.source(source)?.cache_delete(namespace, key)
    }

    pub fn cache_clear(&self, namespace: &str, source: Option<&str>) -> Result<()> {
        self.source(source)?.cache_clear(namespace)
    }

    /// Every persisted cache row across sources, deduplicated by
    /// `(namespace, key)` — first source in probe order wins.
    pub fn cache_dump(&self) -> Result<Vec<CacheRow>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for source in self.each_source() {
            match source.cache_dump() {
                Ok(rows) => {
                    for row in rows {
                        if seen.insert((row.namespace.clone(), row.key.clone())) {
                            out.push(row);
                        }
                    }
                }
                Err(e) => warn!(source = source.name(), error = %e, "cache_dump failed; skipping source"),
            }
        }
        Ok(out)
    }

    pub fn api_cache_set(
        &self,
        domain: &str,
        key: &str,
        value: &serde_json::Value,
        stored_at: i64,
        source: Option<&str>,
    ) -> Result<()> {
        self.source(source)?.api_cache_set(domain, key, value, stored_at)
    }

    /// Typed-cache read: first hit across sources in probe order, no dedup.
    pub fn api_cache_get(&self, domain: &str, key: &str) -> Result<Option<ApiCacheRow>> {
        for source in self.each_source() {
            match source.api_cache_get(domain, key) {
                Ok(Some(row)) => return Ok(Some(row)),
                Ok(None) => {}
                Err(e) => warn!(source = source.name(), error = %e, "api_cache_get failed; skipping source"),
            }
        }
        Ok(None)
    }

    pub fn summary_set(&self, csid: &str, summary: &str, created_at: i64, source: Option<&str>) -> Result<()> {
        self.source(source)?.summary_set(csid, summary, created_at)
    }

    /// Summary memo read: first hit across sources.
    pub fn summary_get(&self, csid: &str) -> Result<Option<String>> {
        for source in self.each_source() {
            match source.summary_get(csid) {
                Ok(Some(summary)) => return Ok(Some(summary)),
                Ok(None) => {}
                Err(e) => warn!(source = source.name(), error = %e, "summary_get failed; skipping source"),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use govorun_core::config::SourceConfig;

    use crate::types::{ChatKind, ChatUser};

    /// Two sources: `main` (rw, default) and `archive` (ro, mapped to chat -100).
    /// The archive is seeded read-write first, then reopened read-only.
    fn two_source_router() -> (tempfile::TempDir, StorageRouter) {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("main.db").to_string_lossy().into_owned();
        let archive_path = dir.path().join("archive.db").to_string_lossy().into_owned();

        // Seed the archive with schema + one membership row.
        {
            let seed = SqliteSource::open(
                "archive",
                &SourceConfig {
                    path: archive_path.clone(),
                    readonly: false,
                    pool_size: 1,
                    timeout: 1,
                },
            )
            .unwrap();
            run_migrations(&seed).unwrap();
            seed.upsert_chat(&Chat {
                chat_id: -100,
                kind: ChatKind::Group,
                title: "archived".to_string(),
                flags: 0,
            })
            .unwrap();
            seed.upsert_chat_user(&ChatUser::new(-100, 42, "old", None))
                .unwrap();
        }

        let mut sources = HashMap::new();
        sources.insert(
            "main".to_string(),
            SourceConfig {
                path: main_path,
                readonly: false,
                pool_size: 2,
                timeout: 1,
            },
        );
        sources.insert(
            "archive".to_string(),
            SourceConfig {
                path: archive_path,
                readonly: true,
                pool_size: 1,
                timeout: 1,
            },
        );
        let mut chat_mapping = HashMap::new();
        chat_mapping.insert("-100".to_string(), "archive".to_string());

        let config = DatabaseConfig {
            default: "main".to_string(),
            sources,
            chat_mapping,
        };
        let router = StorageRouter::open(&config).unwrap();
        (dir, router)
    }

    #[test]
    fn routing_precedence_hint_then_mapping_then_default() {
        let (_dir, router) = two_source_router();
        assert_eq!(router.source_for_chat(-100, None).unwrap().name(), "archive");
        assert_eq!(router.source_for_chat(-200, None).unwrap().name(), "main");
        assert_eq!(
            router.source_for_chat(-100, Some("main")).unwrap().name(),
            "main"
        );
        assert!(router.source(Some("nope")).is_err());
    }

    #[test]
    fn write_to_mapped_readonly_source_fails_without_side_effect() {
        let (_dir, router) = two_source_router();
        let user = ChatUser::new(-100, 99, "new", None);
        // chat -100 maps to the read-only archive
        assert!(matches!(
            router.upsert_chat_user(&user, None),
            Err(StorageError::ReadOnlySource(_))
        ));
        assert!(matches!(
            router.get_chat_user(-100, 99, None),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn reads_follow_the_mapping() {
        let (_dir, router) = two_source_router();
        // The archived chat is only in the archive source.
        assert_eq!(router.get_chat(-100, None).unwrap().title, "archived");
        // The main source does not have it.
        assert!(router.get_chat(-100, Some("main")).is_err());
    }

    #[test]
    fn user_chats_aggregates_and_dedups() {
        let (_dir, router) = two_source_router();
        // Same membership also exists in main → must be deduplicated.
        router
            .upsert_chat_user(&ChatUser::new(-100, 42, "dup", None), Some("main"))
            .unwrap();
        router
            .upsert_chat_user(&ChatUser::new(-300, 42, "other", None), None)
            .unwrap();

        let memberships = router.list_user_chats(42).unwrap();
        let mut keys: Vec<(i64, i64)> = memberships.iter().map(|m| (m.user_id, m.chat_id)).collect();
        keys.sort();
        assert_eq!(keys, vec![(42, -300), (42, -100)]);
    }

    #[test]
    fn chats_aggregate_dedups_by_chat_id() {
        let (_dir, router) = two_source_router();
        router
            .upsert_chat(
                &Chat {
                    chat_id: -100,
                    kind: ChatKind::Group,
                    title: "shadow copy".to_string(),
                    flags: 0,
                },
                Some("main"),
            )
            .unwrap();
        let chats = router.list_all_chats().unwrap();
        assert_eq!(chats.iter().filter(|c| c.chat_id == -100).count(), 1);
        // Probe order puts the default source first, so its row wins.
        assert_eq!(
            chats.iter().find(|c| c.chat_id == -100).unwrap().title,
            "shadow copy"
        );
    }

    #[test]
    fn api_cache_first_match_wins() {
        let (_dir, router) = two_source_router();
        router
            .api_cache_set("weather", "Minsk", &serde_json::json!({"t": 1}), 10, Some("main"))
            .unwrap();
        let row = router.api_cache_get("weather", "Minsk").unwrap().unwrap();
        assert_eq!(row.value["t"], 1);
        assert!(router.api_cache_get("weather", "Pinsk").unwrap().is_none());
    }
}
