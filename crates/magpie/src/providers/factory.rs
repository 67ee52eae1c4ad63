use super::{base::Provider, configs::ProviderConfig, openrouter::OpenRouterProvider};
use anyhow::Result;
use strum_macros::{Display, EnumIter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    OpenRouter,
}

pub fn get_provider(config: ProviderConfig) -> Result<Box<dyn Provider + Send + Sync>> {
    match config {
        ProviderConfig::OpenRouter(openrouter_config) => {
            Ok(Box::new(OpenRouterProvider::new(openrouter_config)?))
        }
    }
}
