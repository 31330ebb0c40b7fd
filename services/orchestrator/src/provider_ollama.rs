use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine as _;
use modelops::{Modality, ModelVariantDescriptor};

use crate::provider::{InferenceBackend, InferenceInput, ProviderInfo};

/// Ollama over its HTTP API. Models are kept resident with `keep_alive: -1`
/// and evicted with `keep_alive: 0`, so residency follows the lifecycle
/// controller rather than Ollama's idle timer.
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn generate(&self, model: &str, keep_alive: i64) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "model": model,
            "keep_alive": keep_alive,
            "stream": false,
        });
        let url = format!("{}/api/generate", self.base_url);
        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("ollama unreachable while setting keep_alive for {model}"))?
            .error_for_status()?;
        Ok(())
    }
}

pub(crate) fn chat_body(model: &str, input: &InferenceInput, images: Vec<String>) -> serde_json::Value {
    let mut message = serde_json::json!({
        "role": "user",
        "content": input.instruction(),
    });
    if !images.is_empty() {
        message["images"] = serde_json::json!(images);
    }
    serde_json::json!({
        "model": model,
        "messages": [message],
        "stream": false,
        "keep_alive": -1,
        "options": { "temperature": 0.2 },
    })
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn load(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()> {
        // An empty generate request loads the model without producing output.
        self.generate(&variant.model_tag, -1).await
    }

    async fn unload(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()> {
        self.generate(&variant.model_tag, 0).await
    }

    async fn infer(
        &self,
        variant: &ModelVariantDescriptor,
        input: &InferenceInput,
    ) -> anyhow::Result<String> {
        let images = match (input.modality, input.payload_ref.as_deref()) {
            (Modality::Text, _) => Vec::new(),
            (Modality::Image, Some(path)) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading image payload {path}"))?;
                vec![base64::engine::general_purpose::STANDARD.encode(bytes)]
            }
            (Modality::Image, None) => bail!("image request without payload"),
            (other, _) => bail!("ollama backend cannot take {other} payloads"),
        };

        let body = chat_body(&variant.model_tag, input, images);
        let url = format!("{}/api/chat", self.base_url);
        let resp = self.client.post(url).json(&body).send().await?.error_for_status()?;
        let json: serde_json::Value = resp.json().await?;

        json["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("ollama response carried no message content")
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        self.client.get(url).send().await?.error_for_status()?;
        Ok(())
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "ollama".to_string(),
            base_url: self.base_url.clone(),
        }
    }

    fn modalities(&self) -> &'static [Modality] {
        &[Modality::Text, Modality::Image]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_body_uses_default_instruction_and_images() {
        let input = InferenceInput {
            modality: Modality::Image,
            prompt: None,
            payload_ref: Some("/tmp/a.jpg".into()),
        };
        let body = chat_body("gemma3n:e4b", &input, vec!["aGVsbG8=".into()]);
        assert_eq!(body["model"], "gemma3n:e4b");
        assert_eq!(body["stream"], false);
        assert_eq!(
            body["messages"][0]["content"],
            "Analyze this image for medical triage assessment."
        );
        assert_eq!(body["messages"][0]["images"][0], "aGVsbG8=");
    }

    #[test]
    fn test_text_body_has_no_images() {
        let input = InferenceInput {
            modality: Modality::Text,
            prompt: Some("Patient conscious, breathing, bleeding from left arm".into()),
            payload_ref: None,
        };
        let body = chat_body("gemma3n:e2b", &input, Vec::new());
        assert!(body["messages"][0].get("images").is_none());
    }
}
