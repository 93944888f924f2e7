use thiserror::Error;

#[derive(Debug, Error)]
pub enum TockError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TockError {
    /// Short error code string used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            TockError::Config(_) => "CONFIG_ERROR",
            TockError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TockError>;
