use async_trait::async_trait;
use modelops::{Modality, ModelVariantDescriptor};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub base_url: String,
}

/// What one inference call works on.
#[derive(Debug, Clone)]
pub struct InferenceInput {
    pub modality: Modality,
    /// Caller instruction or the text itself for text requests.
    pub prompt: Option<String>,
    /// Local path (or URL) of the media.
    pub payload_ref: Option<String>,
}

impl InferenceInput {
    /// The prompt, or the triage instruction for the modality when none was given.
    pub fn instruction(&self) -> &str {
        match self.prompt.as_deref() {
            Some(p) if !p.trim().is_empty() => p,
            _ => default_instruction(self.modality),
        }
    }
}

pub fn default_instruction(modality: Modality) -> &'static str {
    match modality {
        Modality::Text => "Summarize this field report for emergency triage.",
        Modality::Image => "Analyze this image for medical triage assessment.",
        Modality::Audio => {
            "Transcribe this audio accurately, preserving medical terminology and patient information."
        }
        Modality::Video => "Analyze this video for emergency response and medical triage.",
    }
}

/// An on-device inference server that can hold one model at a time.
///
/// `load`/`unload` are only ever called by the lifecycle controller, and never
/// while an `infer` call on the same model is in flight.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()>;
    async fn unload(&self, variant: &ModelVariantDescriptor) -> anyhow::Result<()>;
    async fn infer(
        &self,
        variant: &ModelVariantDescriptor,
        input: &InferenceInput,
    ) -> anyhow::Result<String>;
    async fn ping(&self) -> anyhow::Result<()>;
    fn info(&self) -> ProviderInfo;

    /// Payload kinds `infer` can take. The variant catalog is narrowed to these.
    fn modalities(&self) -> &'static [Modality] {
        &Modality::ALL
    }
}
