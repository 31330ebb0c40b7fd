use anyhow::{bail, Context};
use async_trait::async_trait;
use modelops::{Modality, ModelVariantDescriptor};
use serde::Deserialize;
use tracing::debug;

use crate::provider::{InferenceBackend, InferenceInput, ProviderInfo};

/// A local multimodal model server speaking `POST /chat/{modality}`.
///
/// The server keeps its own model in memory and reads payloads from local
/// paths, so audio and video go through without re-encoding. `load` only
/// checks the server is up; residency is the server's business.
pub struct ModelServerBackend {
    base_url: String,
    client: reqwest::Client,
}

impl ModelServerBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn health(&self) -> anyhow::Result<()> {
        let url = format!("{}/health", self.base_url);
        self.client
            .get(url)
            .send()
            .await
            .context("model server unreachable")?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub(crate) fn chat_body(model: &str, input: &InferenceInput) -> anyhow::Result<serde_json::Value> {
    let mut content = Vec::new();
    if input.modality != Modality::Text {
        let Some(path) = input.payload_ref.as_deref() else {
            bail!("{} request without payload", input.modality);
        };
        let kind = input.modality.as_str();
        let mut item = serde_json::json!({ "type": kind });
        item[kind] = serde_json::json!(path);
        content.push(item);
    }
    content.push(serde_json::json!({ "type": "text", "text": input.instruction() }));

    Ok(serde_json::json!({
        "model": model,
        "messages": [{ "role": "user", "content": content }],
    }))
}

fn reply_text(reply: ChatReply) -> anyhow::Result<String> {
    match reply {
        ChatReply { success: true, response: Some(text), .. } => Ok(text),
        ChatReply { success: true, response: None, .. } => bail!("model server reply carried no response"),
        ChatReply { error, .. } => {
            bail!("model server: {}", error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

#[async_trait]
impl InferenceBackend for ModelServerBackend {
    async fn load(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()> {
        self.health()
            .await
            .with_context(|| format!("model server not ready for {}", variant.model_tag))
    }

    async fn unload(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()> {
        debug!(model = %variant.model_tag, "model server: unload is a no-op");
        Ok(())
    }

    async fn infer(
        &self,
        variant: &ModelVariantDescriptor,
        input: &InferenceInput,
    ) -> anyhow::Result<String> {
        let body = chat_body(&variant.model_tag, input)?;
        let url = format!("{}/chat/{}", self.base_url, input.modality);
        let resp = self.client.post(url).json(&body).send().await?;

        // Failures come back as `success: false` with a 500; keep the message.
        let status = resp.status();
        let reply: ChatReply = resp
            .json()
            .await
            .with_context(|| format!("model server answered HTTP {status} without a JSON body"))?;
        reply_text(reply)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.health().await
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "model_server".to_string(),
            base_url: self.base_url.clone(),
        }
    }
}
