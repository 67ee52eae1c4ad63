use crate::error::{to_env_var, ConfigError};
use config::{Config, Environment};
use magpie::providers::configs::OpenRouterProviderConfig;
use magpie::transport::ServerConfig;
use serde::Deserialize;
use std::net::SocketAddr;

#[derive(Debug, Default, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|err| {
                ConfigError::Other(config::ConfigError::Message(format!(
                    "invalid listen address: {err}"
                )))
            })
    }
}

/// Completion provider settings. The model and the API credential have no
/// defaults on purpose: starting without them is a configuration mistake,
/// not something to paper over per request.
#[derive(Debug, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_host")]
    pub host: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

impl ProviderSettings {
    pub fn into_config(self) -> OpenRouterProviderConfig {
        OpenRouterProviderConfig {
            host: self.host,
            api_key: self.api_key,
            model: self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Which tool server each conversation spawns.
#[derive(Debug, Deserialize)]
pub struct DocServerSettings {
    #[serde(default = "default_doc_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for DocServerSettings {
    fn default() -> Self {
        Self {
            command: default_doc_command(),
            args: Vec::new(),
        }
    }
}

impl DocServerSettings {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new("docs", self.command.clone(), self.args.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub docs: DocServerSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("MAGPIE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("configuration error: {:?}", &err);
                let error_str = err.to_string();
                if error_str.starts_with("missing field") {
                    let field = error_str
                        .trim_start_matches("missing field `")
                        .trim_end_matches('`');
                    // The env source flattens one level, so point at the
                    // provider section where the required fields live.
                    let env_var = to_env_var(&format!("provider.{field}"));
                    Err(ConfigError::MissingEnvVar { env_var })
                } else if let config::ConfigError::NotFound(field) = &err {
                    let env_var = to_env_var(field);
                    Err(ConfigError::MissingEnvVar { env_var })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_provider_host() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_doc_command() -> String {
    "doc-server".to_string()
}
