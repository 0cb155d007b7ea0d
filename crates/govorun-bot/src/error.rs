use thiserror::Error;

use govorun_channels::ChannelError;
use govorun_core::CoreError;
use govorun_llm::ProviderError;
use govorun_scheduler::SchedulerError;
use govorun_services::ServiceError;
use govorun_spam::SpamError;
use govorun_storage::StorageError;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Spam filter error: {0}")]
    Spam(#[from] SpamError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Settings error: {0}")]
    Settings(#[from] CoreError),

    #[error("{0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Short text shown to the chat when a handler fails. At most one such
    /// reply is sent per event.
    pub fn user_message(&self) -> String {
        match self {
            BotError::Validation(msg) => msg.clone(),
            BotError::Settings(e) => e.to_string(),
            BotError::Provider(ProviderError::VisionUnsupported(_)) => {
                "The configured model cannot look at images.".to_string()
            }
            BotError::Provider(_) => {
                "The language model is unavailable right now, try again later.".to_string()
            }
            BotError::Service(_) => "The external service did not answer.".to_string(),
            _ => "Something went wrong, sorry.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
