use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelOpsError {
    #[error("unknown modality: {0}")]
    UnknownModality(String),
    #[error("unknown model variant: {0}")]
    UnknownVariant(String),
    #[error("unknown urgency class: {0}")]
    UnknownUrgency(String),
    #[error("invalid variant catalog: {0}")]
    InvalidCatalog(String),
}

pub type Result<T> = std::result::Result<T, ModelOpsError>;
