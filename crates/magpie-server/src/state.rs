use crate::configuration::Settings;
use magpie::providers::configs::OpenRouterProviderConfig;
use magpie::transport::ServerConfig;
use std::sync::Arc;

/// Shared application state.
///
/// Holds configuration only: every chat request builds its own provider,
/// transport client and agent, so conversations share nothing but settings.
#[derive(Clone)]
pub struct AppState {
    provider_config: Arc<OpenRouterProviderConfig>,
    doc_server_config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let doc_server_config = settings.docs.server_config();
        Self {
            provider_config: Arc::new(settings.provider.into_config()),
            doc_server_config: Arc::new(doc_server_config),
        }
    }

    pub fn provider_config(&self) -> OpenRouterProviderConfig {
        (*self.provider_config).clone()
    }

    pub fn doc_server_config(&self) -> ServerConfig {
        (*self.doc_server_config).clone()
    }
}
