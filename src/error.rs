//! Error types for ringleader

/// Result type alias for ring operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ring operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The ring holds no descriptor or no tokens
    #[error("empty ring")]
    EmptyRing,
    /// The queried instance id or address is not registered in the ring
    #[error("instance not found in the ring")]
    InstanceNotFound,
    /// Quorum is impossible for the requested operation
    #[error("too many unhealthy instances in the ring")]
    TooManyUnhealthyInstances,
    /// A token has no owning instance in the token map. This indicates a bug
    /// in the ring code or memory corruption and is treated as fatal.
    #[error("inconsistent ring tokens information")]
    InconsistentTokensInfo,
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// KV store errors
    #[error("KV store error: {0}")]
    Kv(String),
}
