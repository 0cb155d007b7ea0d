//! Layered chat-settings resolution.
//!
//! Lookup order per key: stored per-chat value → configured default for the
//! chat kind (`bot.defaults."group.detect-spam"`) → configured global default
//! (`bot.defaults."detect-spam"`) → built-in default. The resolved view is
//! memoized in the cache under `chat_settings` with on-change persistence and
//! invalidated by /set and /unset.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use govorun_cache::{Cache, PersistenceLevel};
use govorun_core::settings::{ChatSettingKey, ALL_KEYS};
use govorun_storage::types::ChatKind;
use govorun_storage::StorageRouter;

use crate::error::Result;

pub const SETTINGS_NAMESPACE: &str = "chat_settings";

/// Fully resolved settings of one chat.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    values: HashMap<String, String>,
}

impl ResolvedSettings {
    fn get(&self, key: ChatSettingKey) -> &str {
        self.values
            .get(key.as_str())
            .map(String::as_str)
            .unwrap_or_else(|| key.builtin_default())
    }

    pub fn chat_model(&self) -> &str {
        self.get(ChatSettingKey::ChatModel)
    }

    pub fn parse_images(&self) -> bool {
        self.flag(ChatSettingKey::ParseImages)
    }

    pub fn detect_spam(&self) -> bool {
        self.flag(ChatSettingKey::DetectSpam)
    }

    pub fn random_answer_probability(&self) -> f64 {
        self.number(ChatSettingKey::RandomAnswerProbability)
    }

    pub fn enable_yandex_search(&self) -> bool {
        self.flag(ChatSettingKey::EnableYandexSearch)
    }

    pub fn spam_score_threshold(&self) -> f64 {
        self.number(ChatSettingKey::SpamScoreThreshold)
    }

    pub fn spam_action(&self) -> &str {
        self.get(ChatSettingKey::SpamAction)
    }

    pub fn unknown_command_action(&self) -> &str {
        self.get(ChatSettingKey::UnknownCommandAction)
    }

    pub fn locale(&self) -> &str {
        self.get(ChatSettingKey::Locale)
    }

    /// The raw key→value view, for the /settings display.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        ALL_KEYS
            .iter()
            .map(|k| (k.as_str(), self.get(*k).to_string()))
            .collect()
    }

    fn flag(&self, key: ChatSettingKey) -> bool {
        matches!(self.get(key), "true" | "on" | "yes" | "1")
    }

    fn number(&self, key: ChatSettingKey) -> f64 {
        self.get(key)
            .parse()
            .unwrap_or_else(|_| key.builtin_default().parse().unwrap_or(0.0))
    }
}

pub struct SettingsResolver {
    storage: Arc<StorageRouter>,
    cache: Arc<Cache>,
    /// `bot.defaults` from configuration, possibly kind-scoped.
    config_defaults: HashMap<String, String>,
}

impl SettingsResolver {
    pub fn new(
        storage: Arc<StorageRouter>,
        cache: Arc<Cache>,
        config_defaults: HashMap<String, String>,
    ) -> Self {
        Self {
            storage,
            cache,
            config_defaults,
        }
    }

    /// Resolve (memoized) the settings view of a chat.
    pub fn resolve(&self, chat_id: i64, kind: ChatKind) -> ResolvedSettings {
        let cache_key = chat_id.to_string();
        if let Some((cached, _)) = self.cache.get(SETTINGS_NAMESPACE, &cache_key) {
            if let Ok(values) = serde_json::from_str(&cached) {
                return ResolvedSettings { values };
            }
        }

        let resolved = self.resolve_uncached(chat_id, kind);
        match serde_json::to_string(&resolved.values) {
            Ok(serialized) => self.cache.set(
                SETTINGS_NAMESPACE,
                &cache_key,
                serialized,
                None,
                PersistenceLevel::OnChange,
            ),
            Err(e) => warn!(chat_id, error = %e, "failed to memoize settings"),
        }
        resolved
    }

    fn resolve_uncached(&self, chat_id: i64, kind: ChatKind) -> ResolvedSettings {
        let stored: HashMap<String, String> = match self.storage.all_chat_settings(chat_id, None) {
            Ok(rows) => rows.into_iter().collect(),
            Err(e) => {
                warn!(chat_id, error = %e, "chat settings read failed; using defaults");
                HashMap::new()
            }
        };

        let mut values = HashMap::new();
        for key in ALL_KEYS {
            let name = key.as_str();
            let value = stored
                .get(name)
                .or_else(|| self.config_defaults.get(&format!("{kind}.{name}")))
                .or_else(|| self.config_defaults.get(name))
                .cloned()
                .unwrap_or_else(|| key.builtin_default().to_string());
            values.insert(name.to_string(), value);
        }
        ResolvedSettings { values }
    }

    /// Validate, store and re-memoize one setting.
    pub fn set(&self, chat_id: i64, kind: ChatKind, key_name: &str, raw: &str) -> Result<String> {
        let key = ChatSettingKey::from_str(key_name)?;
        let value = key.coerce(raw)?;
        let stored = value.to_stored();
        self.storage
            .set_chat_setting(chat_id, key.as_str(), &stored, None)?;
        self.invalidate(chat_id);
        // Re-memoize eagerly so the next event sees the fresh view.
        self.resolve(chat_id, kind);
        Ok(stored)
    }

    pub fn unset(&self, chat_id: i64, kind: ChatKind, key_name: &str) -> Result<()> {
        let key = ChatSettingKey::from_str(key_name)?;
        self.storage.unset_chat_setting(chat_id, key.as_str(), None)?;
        self.invalidate(chat_id);
        self.resolve(chat_id, kind);
        Ok(())
    }

    fn invalidate(&self, chat_id: i64) {
        self.cache.delete(SETTINGS_NAMESPACE, &chat_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use govorun_core::config::DatabaseConfig;

    fn resolver(defaults: &[(&str, &str)]) -> (tempfile::TempDir, SettingsResolver) {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DatabaseConfig::default();
        db.sources.get_mut("main").unwrap().path =
            dir.path().join("settings.db").to_string_lossy().into_owned();
        let storage = Arc::new(StorageRouter::open(&db).unwrap());
        let cache = Arc::new(Cache::new(Arc::clone(&storage)));
        let config_defaults = defaults
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        (
            dir,
            SettingsResolver::new(storage, cache, config_defaults),
        )
    }

    #[test]
    fn builtin_defaults_apply_without_config() {
        let (_dir, resolver) = resolver(&[]);
        let settings = resolver.resolve(-100, ChatKind::Group);
        assert!(!settings.detect_spam());
        assert_eq!(settings.spam_score_threshold(), 0.8);
        assert_eq!(settings.locale(), "ru");
    }

    #[test]
    fn config_default_beats_builtin() {
        let (_dir, resolver) = resolver(&[("detect-spam", "true")]);
        let settings = resolver.resolve(-100, ChatKind::Group);
        assert!(settings.detect_spam());
    }

    #[test]
    fn kind_scoped_default_beats_global_default() {
        let (_dir, resolver) = resolver(&[
            ("detect-spam", "true"),
            ("private.detect-spam", "false"),
        ]);
        assert!(resolver.resolve(-100, ChatKind::Group).detect_spam());
        assert!(!resolver.resolve(42, ChatKind::Private).detect_spam());
    }

    #[test]
    fn stored_value_beats_everything() {
        let (_dir, resolver) = resolver(&[("detect-spam", "true")]);
        resolver
            .set(-100, ChatKind::Group, "detect-spam", "off")
            .unwrap();
        assert!(!resolver.resolve(-100, ChatKind::Group).detect_spam());

        resolver.unset(-100, ChatKind::Group, "detect-spam").unwrap();
        assert!(resolver.resolve(-100, ChatKind::Group).detect_spam());
    }

    #[test]
    fn set_rejects_bad_values() {
        let (_dir, resolver) = resolver(&[]);
        assert!(resolver
            .set(-100, ChatKind::Group, "spam-score-threshold", "high")
            .is_err());
        assert!(resolver
            .set(-100, ChatKind::Group, "nonexistent-key", "1")
            .is_err());
    }

    #[test]
    fn memoized_view_is_persisted_on_change() {
        let (_dir, resolver) = resolver(&[]);
        resolver.resolve(-100, ChatKind::Group);
        // The memo is written through to the store (on-change persistence).
        let row = resolver
            .storage
            .cache_get(SETTINGS_NAMESPACE, "-100", None)
            .unwrap();
        assert!(row.is_some());
    }
}
