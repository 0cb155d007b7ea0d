use std::collections::HashMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Top-level config (govorun.toml from one or more directories + GOVORUN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovorunConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub telegram: PlatformConfig,
    #[serde(default)]
    pub max: PlatformConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderBinding>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub spam: SpamConfig,
    #[serde(default)]
    pub resender: ResenderConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    /// Owner handles with admin rights in every chat.
    #[serde(default)]
    pub bot_owners: Vec<String>,
    /// Built-in chat-setting defaults, keyed by setting name (kebab-case).
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    /// Character budget for assembled LLM context (~4 chars per token).
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,
}

/// One chat platform adapter (Telegram or Max — same knobs for both).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// `poll` (default) or `webhook`.
    #[serde(default)]
    pub ingress: IngressMode,
    /// Shared secret expected on webhook requests.
    pub webhook_secret: Option<String>,
    /// Bind address for the webhook listener (e.g. "0.0.0.0:8081").
    pub webhook_bind: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressMode {
    #[default]
    Poll,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Name of the source used when no hint or mapping applies.
    #[serde(default = "default_source_name")]
    pub default: String,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    /// Routing overrides: chat-id (as string, TOML keys) → source name.
    #[serde(default, rename = "chatMapping")]
    pub chat_mapping: HashMap<String, String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let mut sources = HashMap::new();
        sources.insert(default_source_name(), SourceConfig::default());
        Self {
            default: default_source_name(),
            sources,
            chat_mapping: HashMap::new(),
        }
    }
}

impl DatabaseConfig {
    /// Parse the string-keyed chat mapping into numeric chat ids.
    /// Unparsable keys are rejected at startup.
    pub fn chat_mapping_parsed(&self) -> Result<HashMap<i64, String>> {
        let mut out = HashMap::with_capacity(self.chat_mapping.len());
        for (k, v) in &self.chat_mapping {
            let id: i64 = k.parse().map_err(|_| {
                CoreError::Config(format!("database.chatMapping: bad chat id key '{k}'"))
            })?;
            out.insert(id, v.clone());
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_pool_size", rename = "pool-size")]
    pub pool_size: usize,
    /// SQLite busy timeout in seconds.
    #[serde(default = "default_db_timeout")]
    pub timeout: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            readonly: false,
            pool_size: default_pool_size(),
            timeout: default_db_timeout(),
        }
    }
}

/// A single LLM provider binding, keyed by model id in `providers.<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBinding {
    /// Provider wire protocol: `openai` (compatible vendors) or `anthropic`.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Model name sent to the provider.
    pub model_id: String,
    /// Base URL without trailing slash.
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "bool_true")]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    /// Binding id to fall through to after retries are exhausted.
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Binding used when a chat has no `chat-model` setting.
    pub default_model: Option<String>,
    /// Maximum model↔tool round trips per event.
    #[serde(default = "default_max_tool_depth")]
    pub max_tool_depth: u32,
    /// Attempts per provider before falling through to its fallback.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            max_tool_depth: default_max_tool_depth(),
            max_attempts: default_max_attempts(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Flush interval for `periodic`-persistence entries.
    #[serde(default = "default_persistence_period")]
    pub persistence_period_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistence_period_secs: default_persistence_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default)]
    pub claim: ClaimPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            claim: ClaimPolicy::default(),
        }
    }
}

/// When a delayed task is marked done relative to its handler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimPolicy {
    /// Flip `is_done` only after the handler returns success.
    #[default]
    AfterSuccess,
    /// Flip `is_done` before running; handlers must be idempotent.
    BeforeRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamConfig {
    /// Laplace smoothing constant.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Minimum trained messages on each side before a per-chat model is used.
    #[serde(default = "default_min_messages")]
    pub min_messages_per_class: u32,
    /// Tokens shorter than this are dropped by the tokenizer.
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            min_messages_per_class: default_min_messages(),
            min_token_len: default_min_token_len(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResenderConfig {
    #[serde(default)]
    pub jobs: Vec<ResenderJob>,
}

/// Cross-chat republication: media groups landing in `source_chat_id` are
/// re-posted to `target_chat_id` once the album is complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResenderJob {
    pub id: String,
    pub source_chat_id: i64,
    pub target_chat_id: i64,
    #[serde(default = "default_group_delay")]
    pub media_group_delay_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub openweathermap: Option<ApiKeyConfig>,
    #[serde(rename = "yandex-search")]
    pub yandex_search: Option<YandexSearchConfig>,
    pub geocoder: Option<GeocoderConfig>,
    pub image: Option<ImageServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(rename = "api-key")]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YandexSearchConfig {
    #[serde(rename = "api-key")]
    pub api_key: String,
    #[serde(rename = "folder-id", default)]
    pub folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "default_geocoder_endpoint")]
    pub endpoint: String,
    /// Identification sent in the User-Agent header, required by public instances.
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageServiceConfig {
    pub endpoint: String,
    #[serde(rename = "api-key")]
    pub api_key: String,
    /// Binding id of a vision-capable model used for /analyze and captions.
    pub vision_model: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_source_name() -> String {
    "main".to_string()
}
fn default_db_path() -> String {
    "govorun.db".to_string()
}
fn default_pool_size() -> usize {
    4
}
fn default_db_timeout() -> u64 {
    5
}
fn default_temperature() -> f64 {
    0.7
}
fn default_context_size() -> u32 {
    128_000
}
fn default_max_tool_depth() -> u32 {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_persistence_period() -> u64 {
    300
}
fn default_tick_secs() -> u64 {
    1
}
fn default_alpha() -> f64 {
    1.0
}
fn default_min_messages() -> u32 {
    5
}
fn default_min_token_len() -> usize {
    3
}
fn default_group_delay() -> u64 {
    5
}
fn default_context_token_budget() -> usize {
    2048
}
fn default_geocoder_endpoint() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

impl GovorunConfig {
    /// Load config by merging `govorun.toml` from each directory in order
    /// (later directories override earlier ones), then GOVORUN_* env vars.
    pub fn load<P: AsRef<Path>>(config_dirs: &[P]) -> Result<Self> {
        let mut figment = Figment::new();
        for dir in config_dirs {
            figment = figment.merge(Toml::file(dir.as_ref().join("govorun.toml")));
        }
        let config: GovorunConfig = figment
            .merge(Env::prefixed("GOVORUN_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the process cannot start with.
    pub fn validate(&self) -> Result<()> {
        if !self.database.sources.contains_key(&self.database.default) {
            return Err(CoreError::Config(format!(
                "database.default '{}' is not a configured source",
                self.database.default
            )));
        }
        for name in self.database.chat_mapping.values() {
            if !self.database.sources.contains_key(name) {
                return Err(CoreError::Config(format!(
                    "database.chatMapping points at unknown source '{name}'"
                )));
            }
        }
        self.database.chat_mapping_parsed()?;
        for (id, binding) in &self.providers {
            if let Some(fb) = &binding.fallback {
                if !self.providers.contains_key(fb) {
                    return Err(CoreError::Config(format!(
                        "providers.{id}.fallback points at unknown binding '{fb}'"
                    )));
                }
            }
        }
        if self.telegram.enabled && self.telegram.bot_token.is_empty() {
            return Err(CoreError::Config(
                "telegram.enabled is set but telegram.bot_token is empty".to_string(),
            ));
        }
        if self.max.enabled && self.max.bot_token.is_empty() {
            return Err(CoreError::Config(
                "max.enabled is set but max.bot_token is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) {
        let mut f = std::fs::File::create(dir.join("govorun.toml")).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn defaults_are_valid() {
        let config = GovorunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.database.default, "main");
        assert_eq!(config.scheduler.tick_secs, 1);
        assert_eq!(config.llm.max_tool_depth, 5);
    }

    #[test]
    fn later_directory_overrides_earlier() {
        let base = tempfile::tempdir().unwrap();
        let over = tempfile::tempdir().unwrap();
        write_config(base.path(), "[scheduler]\ntick_secs = 10\n");
        write_config(over.path(), "[scheduler]\ntick_secs = 2\n");

        let config = GovorunConfig::load(&[base.path(), over.path()]).unwrap();
        assert_eq!(config.scheduler.tick_secs, 2);
    }

    #[test]
    fn chat_mapping_keys_parse_to_ids() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[database]\ndefault = \"main\"\n\
             [database.sources.main]\npath = \"main.db\"\n\
             [database.sources.archive]\npath = \"archive.db\"\nreadonly = true\n\
             [database.chatMapping]\n\"-100\" = \"archive\"\n",
        );
        let config = GovorunConfig::load(&[dir.path()]).unwrap();
        let mapping = config.database.chat_mapping_parsed().unwrap();
        assert_eq!(mapping.get(&-100), Some(&"archive".to_string()));
    }

    #[test]
    fn unknown_default_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[database]\ndefault = \"nope\"\n");
        assert!(GovorunConfig::load(&[dir.path()]).is_err());
    }

    #[test]
    fn enabled_platform_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[telegram]\nenabled = true\n");
        assert!(GovorunConfig::load(&[dir.path()]).is_err());
    }

    #[test]
    fn provider_fallback_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[providers.main]\ntype = \"openai\"\nmodel_id = \"gpt-4o\"\n\
             endpoint = \"https://api.openai.com\"\nfallback = \"missing\"\n",
        );
        assert!(GovorunConfig::load(&[dir.path()]).is_err());
    }
}
