use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {env_var} is not set")]
    MissingEnvVar { env_var: String },

    #[error(transparent)]
    Other(#[from] config::ConfigError),
}

/// Map a settings field path back to the environment variable a user would
/// set, e.g. `provider.api_key` -> `MAGPIE_PROVIDER__API_KEY`.
pub fn to_env_var(field: &str) -> String {
    format!("MAGPIE_{}", field.replace('.', "__").to_uppercase())
}
