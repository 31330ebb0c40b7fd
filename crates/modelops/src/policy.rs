//! Variant selection.
//!
//! | load     | quick | complex |
//! |----------|-------|---------|
//! | HIGH     | small | small   |
//! | MODERATE | small | large*  |
//! | LOW      | large*| large*  |
//!
//! `*` only when the device profile supports the large variant and the large
//! variant handles the request's modality; otherwise small. An operator
//! override bypasses the table.

use crate::{DeviceCapabilityProfile, LoadLevel, Modality, Urgency, VariantCatalog, VariantId};

#[derive(Clone, Copy, Debug)]
pub struct SelectionRequest {
    pub level: LoadLevel,
    pub urgency: Urgency,
    pub modality: Modality,
    pub override_variant: Option<VariantId>,
}

pub fn select(
    catalog: &VariantCatalog,
    profile: &DeviceCapabilityProfile,
    req: &SelectionRequest,
) -> VariantId {
    if let Some(forced) = req.override_variant {
        return forced;
    }

    let large_ok = profile.supports(VariantId::Large)
        && catalog.get(VariantId::Large).supports(req.modality);

    let preferred = match req.level {
        LoadLevel::High => return VariantId::Small,
        LoadLevel::Moderate if req.urgency == Urgency::Complex && large_ok => VariantId::Large,
        LoadLevel::Moderate => VariantId::Small,
        LoadLevel::Low if large_ok => VariantId::Large,
        LoadLevel::Low => VariantId::Small,
    };

    // The small variant may be text-only on some deployments.
    if preferred == VariantId::Small
        && !catalog.get(VariantId::Small).supports(req.modality)
        && large_ok
    {
        return VariantId::Large;
    }
    preferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostProbe, ModelVariantDescriptor, ResourceCost};

    fn catalog() -> VariantCatalog {
        VariantCatalog::with_tags("gemma3n:e2b", 2_000, "gemma3n:e4b", 4_000).unwrap()
    }

    fn profile(large: bool) -> DeviceCapabilityProfile {
        let probe = HostProbe {
            jetson_marker: true,
            has_cuda: true,
            total_memory_mb: if large { 16_000 } else { 3_000 },
            available_memory_mb: 2_000,
        };
        DeviceCapabilityProfile::from_probe(&probe, &catalog())
    }

    fn req(level: LoadLevel, urgency: Urgency) -> SelectionRequest {
        SelectionRequest { level, urgency, modality: Modality::Video, override_variant: None }
    }

    #[test]
    fn test_low_load_complex_picks_large() {
        let v = select(&catalog(), &profile(true), &req(LoadLevel::Low, Urgency::Complex));
        assert_eq!(v, VariantId::Large);
    }

    #[test]
    fn test_high_load_overrides_urgency() {
        let v = select(&catalog(), &profile(true), &req(LoadLevel::High, Urgency::Complex));
        assert_eq!(v, VariantId::Small);
    }

    #[test]
    fn test_manual_override_wins() {
        let mut r = req(LoadLevel::Low, Urgency::Complex);
        r.override_variant = Some(VariantId::Small);
        assert_eq!(select(&catalog(), &profile(true), &r), VariantId::Small);
    }

    #[test]
    fn test_moderate_load_splits_on_urgency() {
        let c = catalog();
        let p = profile(true);
        assert_eq!(select(&c, &p, &req(LoadLevel::Moderate, Urgency::Quick)), VariantId::Small);
        assert_eq!(select(&c, &p, &req(LoadLevel::Moderate, Urgency::Complex)), VariantId::Large);
    }

    #[test]
    fn test_unsupported_large_never_selected() {
        let c = catalog();
        let p = profile(false);
        for level in [LoadLevel::Low, LoadLevel::Moderate, LoadLevel::High] {
            for urgency in [Urgency::Quick, Urgency::Complex] {
                assert_eq!(select(&c, &p, &req(level, urgency)), VariantId::Small);
            }
        }
    }

    #[test]
    fn test_large_without_modality_falls_back_to_small() {
        let small = catalog().get(VariantId::Small).clone();
        let large = ModelVariantDescriptor {
            id: VariantId::Large,
            model_tag: "text-only-xl".into(),
            cost: ResourceCost { memory_mb: 4_000, relative_compute: 2.0 },
            modalities: vec![Modality::Text],
        };
        let c = VariantCatalog::new(small, large).unwrap();
        let v = select(&c, &profile(true), &req(LoadLevel::Low, Urgency::Complex));
        assert_eq!(v, VariantId::Small);
    }
}
