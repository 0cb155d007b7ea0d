//! External-service clients: weather, web search, geocoding and image
//! generation. Each client reads through its typed cache domain with a
//! per-domain TTL and stores the raw upstream JSON on a miss.

pub mod geocode;
pub mod image;
pub mod search;
pub mod weather;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// True when a cached row from `stored_at` is still inside `ttl_secs`.
pub(crate) fn fresh(stored_at: i64, ttl_secs: i64) -> bool {
    chrono::Utc::now().timestamp() - stored_at < ttl_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_window() {
        let now = chrono::Utc::now().timestamp();
        assert!(fresh(now, 600));
        assert!(!fresh(now - 601, 600));
    }
}
