use thiserror::Error;

/// Errors raised while parsing or building shard tags.
#[derive(Debug, Error)]
pub enum ShardError {
    /// The string form of a shard tag is malformed.
    ///
    /// Expected format: `{node_count}-{node_id}`
    #[error("invalid shard tag: {0}")]
    InvalidTag(String),
}

pub type Result<T> = std::result::Result<T, ShardError>;
