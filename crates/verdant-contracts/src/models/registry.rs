use indexmap::IndexMap;

pub const CAPABILITY_VISION: &str = "vision";
pub const CAPABILITY_TEXT: &str = "text";
pub const CAPABILITY_CHAT: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Higher capability, tried first.
    Primary,
    /// Lower capability, used once when the primary call fails.
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub tier: ModelTier,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str, tier: ModelTier) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.tier == tier && model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, tier: ModelTier| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: "gemini".to_string(),
                tier,
                capabilities: [CAPABILITY_VISION, CAPABILITY_TEXT, CAPABILITY_CHAT]
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("gemini-1.5-pro", ModelTier::Primary);
    insert("gemini-2.0-flash", ModelTier::Primary);
    insert("gemini-1.5-flash", ModelTier::Secondary);
    insert("gemini-1.5-flash-8b", ModelTier::Secondary);

    map
}
