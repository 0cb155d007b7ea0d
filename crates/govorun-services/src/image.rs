//! Image-generation client against an OpenAI-style `/v1/images/generations`
//! endpoint. Generated images are not cached: two identical prompts are
//! expected to produce different pictures.

use serde::Deserialize;
use tracing::debug;

use govorun_core::config::ImageServiceConfig;

use crate::{Result, ServiceError};

pub struct ImageService {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    /// Binding id of the vision model used for /analyze and captions.
    pub vision_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    /// Base64 PNG payload.
    pub base64: String,
    /// Prompt actually used (providers may revise it).
    pub prompt: String,
}

impl ImageService {
    pub fn new(config: &ImageServiceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.endpoint.clone(),
            vision_model: config.vision_model.clone(),
        }
    }

    pub async fn generate(&self, prompt: &str) -> Result<GeneratedImage> {
        debug!(prompt_len = prompt.len(), "requesting image generation");
        let url = format!("{}/v1/images/generations", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "prompt": prompt,
                "n": 1,
                "size": "1024x1024",
                "response_format": "b64_json",
            }))
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Api { status, message });
        }

        let raw: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ServiceError::Parse(e.to_string()))?;
        let first = raw
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Parse("empty image data".to_string()))?;
        Ok(GeneratedImage {
            base64: first.b64_json,
            prompt: first.revised_prompt.unwrap_or_else(|| prompt.to_string()),
        })
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    data: Vec<ApiImage>,
}

#[derive(Deserialize)]
struct ApiImage {
    b64_json: String,
    revised_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shape_parses() {
        let raw = serde_json::json!({
            "created": 1700000000,
            "data": [{ "b64_json": "aGVsbG8=", "revised_prompt": "a cat, oil painting" }]
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.data[0].b64_json, "aGVsbG8=");
        assert_eq!(
            resp.data[0].revised_prompt.as_deref(),
            Some("a cat, oil painting")
        );
    }
}
