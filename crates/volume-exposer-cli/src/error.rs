//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] volume_exposer_core::Error),

    #[error("kubeconfig error: {message}")]
    Kubeconfig { message: String },

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl Error {
    pub fn kubeconfig(message: impl Into<String>) -> Self {
        Error::Kubeconfig {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}
