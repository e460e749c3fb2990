use harvest_engine::HarvestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] HarvestError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job failed ({kind}): {reason}")]
    JobFailed { kind: String, reason: String },
}

pub type Result<T> = std::result::Result<T, AppError>;
