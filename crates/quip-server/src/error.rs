use quip_core::provider::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
