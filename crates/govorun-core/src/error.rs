use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown chat setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid value for setting {key}: {reason}")]
    InvalidSettingValue { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
