mod registry;
mod selectors;

pub use registry::{
    ModelRegistry, ModelSpec, ModelTier, CAPABILITY_CHAT, CAPABILITY_TEXT, CAPABILITY_VISION,
};
pub use selectors::{ModelChain, ModelSelector};
