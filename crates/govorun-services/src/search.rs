//! Yandex web-search client. Cached in the `search` domain under
//! `query|page` for an hour.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use govorun_cache::Cache;
use govorun_core::config::YandexSearchConfig;

use crate::{fresh, Result, ServiceError};

const DOMAIN: &str = "search";
const TTL_SECS: i64 = 3600;
const PAGE_SIZE: usize = 10;

pub struct SearchService {
    client: reqwest::Client,
    api_key: String,
    folder_id: String,
    base_url: String,
    cache: Arc<Cache>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

impl SearchService {
    pub fn new(config: &YandexSearchConfig, cache: Arc<Cache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            folder_id: config.folder_id.clone(),
            base_url: "https://searchapi.api.cloud.yandex.net".to_string(),
            cache,
        }
    }

    pub async fn search(&self, query: &str, page: usize) -> Result<Vec<SearchHit>> {
        let key = cache_key(query, page);
        if let Some((cached, stored_at)) = self.cache.api_get(DOMAIN, &key) {
            if fresh(stored_at, TTL_SECS) {
                debug!(key, "search cache hit");
                return parse_hits(&cached);
            }
        }

        let url = format!("{}/v2/web/searchAsync", self.base_url);
        let body = serde_json::json!({
            "query": {
                "searchType": "SEARCH_TYPE_COM",
                "queryText": query,
                "page": page,
            },
            "folderId": self.folder_id,
            "responseFormat": "FORMAT_JSON",
            "groupSpec": { "groupsOnPage": PAGE_SIZE },
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Api { status, message });
        }

        let raw: serde_json::Value = resp.json().await?;
        self.cache.api_set(DOMAIN, &key, &raw);
        parse_hits(&raw)
    }
}

fn cache_key(query: &str, page: usize) -> String {
    format!("{query}|{page}")
}

fn parse_hits(raw: &serde_json::Value) -> Result<Vec<SearchHit>> {
    let results = raw
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| ServiceError::Parse("missing results array".to_string()))?;
    Ok(results
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_pins_query_and_page() {
        assert_eq!(cache_key("rust borrow checker", 0), "rust borrow checker|0");
        assert_ne!(cache_key("q", 0), cache_key("q", 1));
    }

    #[test]
    fn hits_parse_and_skip_malformed_entries() {
        let raw = serde_json::json!({
            "results": [
                { "title": "Rust", "url": "https://rust-lang.org", "snippet": "A language" },
                { "unexpected": true },
                { "title": "Docs", "url": "https://doc.rust-lang.org" }
            ]
        });
        let hits = parse_hits(&raw).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Rust");
        assert_eq!(hits[1].snippet, "");
    }

    #[test]
    fn missing_results_is_a_parse_error() {
        assert!(parse_hits(&serde_json::json!({})).is_err());
    }
}
