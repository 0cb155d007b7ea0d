//! OpenWeatherMap current-conditions client.
//!
//! Responses are cached in the `weather` typed domain under `city` or
//! `city,cc`; entries older than ten minutes are refetched.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use govorun_cache::Cache;
use govorun_core::config::ApiKeyConfig;

use crate::{fresh, Result, ServiceError};

const DOMAIN: &str = "weather";
const TTL_SECS: i64 = 600;

pub struct WeatherService {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    cache: Arc<Cache>,
}

/// The digest of a weather response handed to tools and commands.
#[derive(Debug, Clone)]
pub struct WeatherReport {
    pub city: String,
    pub description: String,
    pub temp_c: f64,
    pub feels_like_c: f64,
    pub wind_ms: f64,
    pub humidity: i64,
}

impl WeatherService {
    pub fn new(config: &ApiKeyConfig, cache: Arc<Cache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: "https://api.openweathermap.org".to_string(),
            cache,
        }
    }

    /// Current weather for `city` (optionally narrowed by a country code).
    pub async fn current(&self, city: &str, country: Option<&str>) -> Result<WeatherReport> {
        let key = cache_key(city, country);
        if let Some((cached, stored_at)) = self.cache.api_get(DOMAIN, &key) {
            if fresh(stored_at, TTL_SECS) {
                debug!(key, "weather cache hit");
                return parse_report(&cached);
            }
        }

        let url = format!("{}/data/2.5/weather", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("q", key.as_str()),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Api { status, message });
        }

        let raw: serde_json::Value = resp.json().await?;
        self.cache.api_set(DOMAIN, &key, &raw);
        parse_report(&raw)
    }
}

fn cache_key(city: &str, country: Option<&str>) -> String {
    match country {
        Some(cc) => format!("{city},{cc}"),
        None => city.to_string(),
    }
}

fn parse_report(raw: &serde_json::Value) -> Result<WeatherReport> {
    #[derive(Deserialize)]
    struct Raw {
        name: String,
        weather: Vec<RawWeather>,
        main: RawMain,
        wind: RawWind,
    }
    #[derive(Deserialize)]
    struct RawWeather {
        description: String,
    }
    #[derive(Deserialize)]
    struct RawMain {
        temp: f64,
        feels_like: f64,
        humidity: i64,
    }
    #[derive(Deserialize)]
    struct RawWind {
        speed: f64,
    }

    let parsed: Raw =
        serde_json::from_value(raw.clone()).map_err(|e| ServiceError::Parse(e.to_string()))?;
    Ok(WeatherReport {
        city: parsed.name,
        description: parsed
            .weather
            .first()
            .map(|w| w.description.clone())
            .unwrap_or_default(),
        temp_c: parsed.main.temp,
        feels_like_c: parsed.main.feels_like,
        wind_ms: parsed.wind.speed,
        humidity: parsed.main.humidity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_includes_country_when_present() {
        assert_eq!(cache_key("Minsk", None), "Minsk");
        assert_eq!(cache_key("Minsk", Some("by")), "Minsk,by");
    }

    #[test]
    fn report_parses_upstream_shape() {
        let raw = serde_json::json!({
            "name": "Minsk",
            "weather": [{ "description": "light snow" }],
            "main": { "temp": -3.5, "feels_like": -8.1, "humidity": 86 },
            "wind": { "speed": 4.2 }
        });
        let report = parse_report(&raw).unwrap();
        assert_eq!(report.city, "Minsk");
        assert_eq!(report.description, "light snow");
        assert_eq!(report.temp_c, -3.5);
        assert_eq!(report.humidity, 86);
    }

    #[test]
    fn malformed_payload_is_a_parse_error() {
        let raw = serde_json::json!({ "cod": "404", "message": "city not found" });
        assert!(matches!(
            parse_report(&raw),
            Err(ServiceError::Parse(_))
        ));
    }
}
