use crate::{Modality, ModelOpsError, ModelVariantDescriptor, ResourceCost, Result, VariantId};

/// The fixed set of variants this device can serve.
#[derive(Clone, Debug)]
pub struct VariantCatalog {
    small: ModelVariantDescriptor,
    large: ModelVariantDescriptor,
}

impl VariantCatalog {
    pub fn new(small: ModelVariantDescriptor, large: ModelVariantDescriptor) -> Result<Self> {
        if small.id != VariantId::Small || large.id != VariantId::Large {
            return Err(ModelOpsError::InvalidCatalog(format!(
                "expected (small, large), got ({}, {})",
                small.id, large.id
            )));
        }
        if small.model_tag.trim().is_empty() || large.model_tag.trim().is_empty() {
            return Err(ModelOpsError::InvalidCatalog("model tag must not be empty".into()));
        }
        if small.modalities.is_empty() {
            return Err(ModelOpsError::InvalidCatalog(
                "small variant must support at least one modality".into(),
            ));
        }
        Ok(Self { small, large })
    }

    /// Catalog with both variants handling every modality.
    pub fn with_tags(small_tag: &str, small_mb: u64, large_tag: &str, large_mb: u64) -> Result<Self> {
        Self::new(
            ModelVariantDescriptor {
                id: VariantId::Small,
                model_tag: small_tag.to_string(),
                cost: ResourceCost { memory_mb: small_mb, relative_compute: 1.0 },
                modalities: Modality::ALL.to_vec(),
            },
            ModelVariantDescriptor {
                id: VariantId::Large,
                model_tag: large_tag.to_string(),
                cost: ResourceCost {
                    memory_mb: large_mb,
                    relative_compute: large_mb as f32 / small_mb.max(1) as f32,
                },
                modalities: Modality::ALL.to_vec(),
            },
        )
    }

    /// Drops the modalities the serving backend cannot take, so selection and
    /// admission only ever see what will actually run.
    pub fn limited_to(self, supported: &[Modality]) -> Result<Self> {
        let restrict = |mut d: ModelVariantDescriptor| {
            d.modalities.retain(|m| supported.contains(m));
            d
        };
        Self::new(restrict(self.small), restrict(self.large))
    }

    /// Whether any variant can serve `modality`.
    pub fn serves(&self, modality: Modality) -> bool {
        self.iter().any(|v| v.supports(modality))
    }

    pub fn get(&self, id: VariantId) -> &ModelVariantDescriptor {
        match id {
            VariantId::Small => &self.small,
            VariantId::Large => &self.large,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelVariantDescriptor> {
        [&self.small, &self.large].into_iter()
    }
}
