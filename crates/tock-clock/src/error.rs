use thiserror::Error;

/// Errors that can occur within the clock subsystem.
#[derive(Debug, Error)]
pub enum ClockError {
    /// The operation only exists on the virtual clock (e.g. manual ticking).
    #[error("Operation not supported by {clock} clock: {operation}")]
    Unsupported {
        clock: &'static str,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ClockError>;
