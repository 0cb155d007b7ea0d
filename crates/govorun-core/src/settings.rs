//! Closed enumeration of per-chat settings.
//!
//! Values are stored as strings; every key owns a coercion that validates and
//! normalizes raw input before it is persisted or resolved. Resolution
//! layering (stored value → kind defaults → config defaults → built-in) lives
//! with the handler manager; this module only defines the vocabulary.

use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Every recognized per-chat setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatSettingKey {
    /// Binding id of the LLM used for replies in this chat.
    ChatModel,
    /// Run vision descriptions on incoming images.
    ParseImages,
    /// Run the Bayes gate on incoming messages.
    DetectSpam,
    /// Probability in [0,1] of replying to an unaddressed message.
    RandomAnswerProbability,
    /// Expose the web_search tool in this chat.
    EnableYandexSearch,
    /// Bayes score at or above which a message is treated as spam.
    SpamScoreThreshold,
    /// What to do with a detected spam message.
    SpamAction,
    /// What to do with an unrecognized /command.
    UnknownCommandAction,
    /// Locale code used for stemming (e.g. "ru", "en").
    Locale,
}

/// Validated, typed view of a setting value.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Text(String),
    Flag(bool),
    Number(f64),
    Choice(&'static str),
}

impl SettingValue {
    /// Canonical string form, as stored.
    pub fn to_stored(&self) -> String {
        match self {
            SettingValue::Text(s) => s.clone(),
            SettingValue::Flag(b) => b.to_string(),
            SettingValue::Number(n) => n.to_string(),
            SettingValue::Choice(c) => c.to_string(),
        }
    }
}

pub const ALL_KEYS: &[ChatSettingKey] = &[
    ChatSettingKey::ChatModel,
    ChatSettingKey::ParseImages,
    ChatSettingKey::DetectSpam,
    ChatSettingKey::RandomAnswerProbability,
    ChatSettingKey::EnableYandexSearch,
    ChatSettingKey::SpamScoreThreshold,
    ChatSettingKey::SpamAction,
    ChatSettingKey::UnknownCommandAction,
    ChatSettingKey::Locale,
];

const SPAM_ACTIONS: &[&str] = &["delete", "ban", "notify"];
const UNKNOWN_COMMAND_ACTIONS: &[&str] = &["delete", "ignore"];

impl ChatSettingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatSettingKey::ChatModel => "chat-model",
            ChatSettingKey::ParseImages => "parse-images",
            ChatSettingKey::DetectSpam => "detect-spam",
            ChatSettingKey::RandomAnswerProbability => "random-answer-probability",
            ChatSettingKey::EnableYandexSearch => "enable-yandex-search",
            ChatSettingKey::SpamScoreThreshold => "spam-score-threshold",
            ChatSettingKey::SpamAction => "spam-action",
            ChatSettingKey::UnknownCommandAction => "unknown-command-action",
            ChatSettingKey::Locale => "locale",
        }
    }

    /// Built-in default, the last layer of resolution.
    pub fn builtin_default(&self) -> &'static str {
        match self {
            ChatSettingKey::ChatModel => "",
            ChatSettingKey::ParseImages => "false",
            ChatSettingKey::DetectSpam => "false",
            ChatSettingKey::RandomAnswerProbability => "0",
            ChatSettingKey::EnableYandexSearch => "false",
            ChatSettingKey::SpamScoreThreshold => "0.8",
            ChatSettingKey::SpamAction => "delete",
            ChatSettingKey::UnknownCommandAction => "ignore",
            ChatSettingKey::Locale => "ru",
        }
    }

    /// Validate and normalize a raw value for this key.
    pub fn coerce(&self, raw: &str) -> Result<SettingValue, CoreError> {
        let raw = raw.trim();
        match self {
            ChatSettingKey::ChatModel | ChatSettingKey::Locale => {
                Ok(SettingValue::Text(raw.to_string()))
            }
            ChatSettingKey::ParseImages
            | ChatSettingKey::DetectSpam
            | ChatSettingKey::EnableYandexSearch => match raw {
                "true" | "on" | "yes" | "1" => Ok(SettingValue::Flag(true)),
                "false" | "off" | "no" | "0" => Ok(SettingValue::Flag(false)),
                _ => Err(self.bad_value("expected true/false")),
            },
            ChatSettingKey::RandomAnswerProbability | ChatSettingKey::SpamScoreThreshold => {
                let n: f64 = raw
                    .parse()
                    .map_err(|_| self.bad_value("expected a number"))?;
                if !(0.0..=1.0).contains(&n) {
                    return Err(self.bad_value("must be between 0 and 1"));
                }
                Ok(SettingValue::Number(n))
            }
            ChatSettingKey::SpamAction => choice(self, raw, SPAM_ACTIONS),
            ChatSettingKey::UnknownCommandAction => choice(self, raw, UNKNOWN_COMMAND_ACTIONS),
        }
    }

    fn bad_value(&self, reason: &str) -> CoreError {
        CoreError::InvalidSettingValue {
            key: self.as_str().to_string(),
            reason: reason.to_string(),
        }
    }
}

fn choice(
    key: &ChatSettingKey,
    raw: &str,
    allowed: &'static [&'static str],
) -> Result<SettingValue, CoreError> {
    allowed
        .iter()
        .find(|v| **v == raw)
        .map(|v| SettingValue::Choice(v))
        .ok_or_else(|| CoreError::InvalidSettingValue {
            key: key.as_str().to_string(),
            reason: format!("must be one of: {}", allowed.join(", ")),
        })
}

impl fmt::Display for ChatSettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatSettingKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_KEYS
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::UnknownSetting(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for key in ALL_KEYS {
            assert_eq!(*key, key.as_str().parse::<ChatSettingKey>().unwrap());
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!("definitely-not-a-setting".parse::<ChatSettingKey>().is_err());
    }

    #[test]
    fn flag_coercion_accepts_aliases() {
        let key = ChatSettingKey::DetectSpam;
        assert_eq!(key.coerce("on").unwrap(), SettingValue::Flag(true));
        assert_eq!(key.coerce("0").unwrap(), SettingValue::Flag(false));
        assert!(key.coerce("maybe").is_err());
    }

    #[test]
    fn probability_bounds_enforced() {
        let key = ChatSettingKey::RandomAnswerProbability;
        assert_eq!(key.coerce("0.25").unwrap(), SettingValue::Number(0.25));
        assert!(key.coerce("1.5").is_err());
        assert!(key.coerce("-0.1").is_err());
    }

    #[test]
    fn spam_action_is_a_closed_choice() {
        let key = ChatSettingKey::SpamAction;
        assert_eq!(key.coerce("ban").unwrap(), SettingValue::Choice("ban"));
        assert!(key.coerce("nuke").is_err());
    }

    #[test]
    fn builtin_defaults_coerce() {
        for key in ALL_KEYS {
            // Every built-in default must pass its own coercion (empty text is fine).
            if !key.builtin_default().is_empty() {
                key.coerce(key.builtin_default()).unwrap();
            }
        }
    }
}
