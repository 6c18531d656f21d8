use super::registry::{ModelRegistry, ModelSpec, ModelTier};

/// The two models one adapter call may touch, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChain {
    pub primary: ModelSpec,
    pub secondary: Option<ModelSpec>,
    pub fallback_reasons: Vec<String>,
}

impl ModelChain {
    pub fn names(&self) -> Vec<&str> {
        let mut names = vec![self.primary.name.as_str()];
        if let Some(secondary) = self.secondary.as_ref() {
            names.push(secondary.name.as_str());
        }
        names
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select_chain(
        &self,
        primary: Option<&str>,
        secondary: Option<&str>,
        capability: &str,
    ) -> Result<ModelChain, String> {
        let mut fallback_reasons = Vec::new();
        let primary = match self.select_tier(primary, capability, ModelTier::Primary, None) {
            (Some(model), reason) => {
                fallback_reasons.extend(reason);
                model
            }
            (None, _) => {
                return Err(format!(
                    "No primary models available for capability '{capability}'."
                ))
            }
        };
        let (secondary, reason) = self.select_tier(
            secondary,
            capability,
            ModelTier::Secondary,
            Some(primary.name.as_str()),
        );
        fallback_reasons.extend(reason);

        Ok(ModelChain {
            primary,
            secondary,
            fallback_reasons,
        })
    }

    fn select_tier(
        &self,
        requested: Option<&str>,
        capability: &str,
        tier: ModelTier,
        exclude: Option<&str>,
    ) -> (Option<ModelSpec>, Option<String>) {
        if let Some(requested_value) = requested {
            if Some(requested_value) == exclude {
                let model = self.tier_default(capability, tier, exclude);
                return (
                    model,
                    Some(format!(
                        "Requested model '{requested_value}' is already selected; using the {} default.",
                        match tier {
                            ModelTier::Primary => "primary",
                            ModelTier::Secondary => "secondary",
                        }
                    )),
                );
            }
            // Explicit requests may cross tiers; only the capability must match.
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                return (Some(model), None);
            }
        }
        let model = self.tier_default(capability, tier, exclude);
        let reason = requested.map(|requested_value| {
            format!("Requested model '{requested_value}' unavailable for capability '{capability}'.")
        });
        (model, reason)
    }

    fn tier_default(
        &self,
        capability: &str,
        tier: ModelTier,
        exclude: Option<&str>,
    ) -> Option<ModelSpec> {
        self.registry
            .by_capability(capability, tier)
            .into_iter()
            .find(|model| Some(model.name.as_str()) != exclude)
    }
}
