use indexmap::IndexMap;

/// Capabilities a media model can carry. Kept as plain strings so embedders
/// can register custom endpoints without touching this crate.
pub const CAP_IMAGE: &str = "image";
pub const CAP_TEXT_TO_VIDEO: &str = "video";
pub const CAP_IMAGE_TO_VIDEO: &str = "image-video";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl MediaModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct MediaModelRegistry {
    models: IndexMap<String, MediaModelSpec>,
}

impl MediaModelRegistry {
    pub fn new(models: Option<IndexMap<String, MediaModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&MediaModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &MediaModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<MediaModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<MediaModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

impl Default for MediaModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: MediaModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaModelSelector {
    pub registry: MediaModelRegistry,
}

impl MediaModelSelector {
    pub fn new(registry: Option<MediaModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (None, None)
        };

        let candidates = self.registry.by_capability(capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

fn default_models() -> IndexMap<String, MediaModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            MediaModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert(
        "imagen-4.0-generate-preview-06-06",
        "google",
        &[CAP_IMAGE],
    );
    insert("veo-3.0-generate-preview", "google", &[CAP_TEXT_TO_VIDEO]);
    insert(
        "veo-2.0-generate-001",
        "google",
        &[CAP_IMAGE_TO_VIDEO, CAP_TEXT_TO_VIDEO],
    );
    insert(
        "dryrun-media-1",
        "dryrun",
        &[CAP_IMAGE, CAP_TEXT_TO_VIDEO, CAP_IMAGE_TO_VIDEO],
    );

    map
}
