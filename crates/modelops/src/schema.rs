use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ModelOpsError;

/// Kind of input an inference request carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
}

impl Modality {
    pub const ALL: [Modality; 4] = [Modality::Text, Modality::Image, Modality::Audio, Modality::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Video => "video",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Modality::Text),
            "image" => Ok(Modality::Image),
            "audio" => Ok(Modality::Audio),
            "video" => Ok(Modality::Video),
            other => Err(ModelOpsError::UnknownModality(other.to_string())),
        }
    }
}

/// The two model configurations the device can hold (one at a time).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantId {
    /// Fast, low-footprint variant.
    Small,
    /// Higher quality, needs considerably more memory.
    Large,
}

impl VariantId {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantId::Small => "small",
            VariantId::Large => "large",
        }
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantId {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" | "fast" => Ok(VariantId::Small),
            "large" | "quality" => Ok(VariantId::Large),
            other => Err(ModelOpsError::UnknownVariant(other.to_string())),
        }
    }
}

/// Caller-provided hint separating quick requests from heavy analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Quick,
    Complex,
}

impl Urgency {
    /// Urgency assumed when the caller gives no hint.
    ///
    /// Short text and transcription are quick; image triage and video
    /// analysis are complex.
    pub fn default_for(modality: Modality) -> Self {
        match modality {
            Modality::Text | Modality::Audio => Urgency::Quick,
            Modality::Image | Modality::Video => Urgency::Complex,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Quick => "quick",
            Urgency::Complex => "complex",
        }
    }
}

impl FromStr for Urgency {
    type Err = ModelOpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Urgency::Quick),
            "complex" => Ok(Urgency::Complex),
            other => Err(ModelOpsError::UnknownUrgency(other.to_string())),
        }
    }
}

/// Discretized system load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadLevel {
    Low,
    Moderate,
    High,
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadLevel::Low => "LOW",
            LoadLevel::Moderate => "MODERATE",
            LoadLevel::High => "HIGH",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceCost {
    /// Approximate resident footprint once loaded.
    pub memory_mb: u64,
    /// Compute cost relative to the small variant (small = 1.0).
    pub relative_compute: f32,
}

/// Static description of one model variant. Built once from configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelVariantDescriptor {
    pub id: VariantId,
    /// Name the inference backend knows the model by (e.g. an Ollama tag).
    pub model_tag: String,
    pub cost: ResourceCost,
    pub modalities: Vec<Modality>,
}

impl ModelVariantDescriptor {
    pub fn supports(&self, modality: Modality) -> bool {
        self.modalities.contains(&modality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Image".parse::<Modality>().unwrap(), Modality::Image);
        assert_eq!(" LARGE ".parse::<VariantId>().unwrap(), VariantId::Large);
        assert_eq!("quality".parse::<VariantId>().unwrap(), VariantId::Large);
        assert!("hologram".parse::<Modality>().is_err());
    }

    #[test]
    fn test_level_serializes_uppercase() {
        let s = serde_json::to_string(&LoadLevel::Moderate).unwrap();
        assert_eq!(s, "\"MODERATE\"");
    }

    #[test]
    fn test_default_urgency() {
        assert_eq!(Urgency::default_for(Modality::Text), Urgency::Quick);
        assert_eq!(Urgency::default_for(Modality::Video), Urgency::Complex);
    }
}
