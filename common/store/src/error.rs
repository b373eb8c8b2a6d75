use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Call-level failure; the caller may retry against the same connection.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The connection is unusable; the caller should degrade.
    #[error("persistent store failure: {0}")]
    Persistent(String),
    /// A script name the engine does not implement.
    #[error("unsupported script '{0}'")]
    UnsupportedScript(&'static str),
}

impl StoreError {
    pub fn is_persistent(&self) -> bool {
        matches!(self, StoreError::Persistent(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Persistent(err.to_string())
        } else {
            StoreError::Transient(err.to_string())
        }
    }
}
