//! Nominatim-style geocoder: forward search, reverse lookup and OSM-id
//! lookup, each with its own typed cache domain. Geodata is slow-moving, so
//! entries live for a day.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use govorun_cache::Cache;
use govorun_core::config::GeocoderConfig;

use crate::{fresh, Result, ServiceError};

const SEARCH_DOMAIN: &str = "geocode-search";
const REVERSE_DOMAIN: &str = "geocode-reverse";
const LOOKUP_DOMAIN: &str = "geocode-lookup";
const TTL_SECS: i64 = 86_400;

pub struct GeocodeService {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    cache: Arc<Cache>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Place {
    pub lat: String,
    pub lon: String,
    pub display_name: String,
    #[serde(default)]
    pub osm_id: i64,
}

impl GeocodeService {
    pub fn new(config: &GeocoderConfig, cache: Arc<Cache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.endpoint.clone(),
            user_agent: config.user_agent.clone(),
            cache,
        }
    }

    /// Forward geocoding: free-text query → candidate places.
    pub async fn search(&self, query: &str) -> Result<Vec<Place>> {
        let raw = self
            .cached_get(
                SEARCH_DOMAIN,
                query,
                "/search",
                &[("q", query), ("format", "json"), ("limit", "5")],
            )
            .await?;
        parse_places(&raw)
    }

    /// Reverse geocoding: coordinates → nearest place.
    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<Place> {
        let key = format!("{lat:.5},{lon:.5}");
        let lat_s = lat.to_string();
        let lon_s = lon.to_string();
        let raw = self
            .cached_get(
                REVERSE_DOMAIN,
                &key,
                "/reverse",
                &[
                    ("lat", lat_s.as_str()),
                    ("lon", lon_s.as_str()),
                    ("format", "json"),
                ],
            )
            .await?;
        serde_json::from_value(raw).map_err(|e| ServiceError::Parse(e.to_string()))
    }

    /// Lookup by OSM ids (e.g. "R146656,W104393803").
    pub async fn lookup(&self, osm_ids: &str) -> Result<Vec<Place>> {
        let raw = self
            .cached_get(
                LOOKUP_DOMAIN,
                osm_ids,
                "/lookup",
                &[("osm_ids", osm_ids), ("format", "json")],
            )
            .await?;
        parse_places(&raw)
    }

    async fn cached_get(
        &self,
        domain: &str,
        key: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value> {
        if let Some((cached, stored_at)) = self.cache.api_get(domain, key) {
            if fresh(stored_at, TTL_SECS) {
                debug!(domain, key, "geocode cache hit");
                return Ok(cached);
            }
        }

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("user-agent", &self.user_agent)
            .query(query)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Api { status, message });
        }

        let raw: serde_json::Value = resp.json().await?;
        self.cache.api_set(domain, key, &raw);
        Ok(raw)
    }
}

fn parse_places(raw: &serde_json::Value) -> Result<Vec<Place>> {
    let entries = raw
        .as_array()
        .ok_or_else(|| ServiceError::Parse("expected a JSON array".to_string()))?;
    Ok(entries
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn places_parse_from_array() {
        let raw = serde_json::json!([
            { "lat": "53.9", "lon": "27.5667", "display_name": "Minsk, Belarus", "osm_id": 59195 },
            { "lat": "52.2297", "lon": "21.0122", "display_name": "Warsaw, Poland" }
        ]);
        let places = parse_places(&raw).unwrap();
        assert_eq!(places.len(), 2);
        assert_eq!(places[0].display_name, "Minsk, Belarus");
        assert_eq!(places[1].osm_id, 0);
    }

    #[test]
    fn non_array_payload_is_a_parse_error() {
        assert!(parse_places(&serde_json::json!({"error": "x"})).is_err());
    }
}
