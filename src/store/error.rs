//! Error types for document store backends.
//!
//! [`StoreError`] covers the ways a backend can fail underneath the
//! coordinator: I/O on the backing file, (de)serialization of documents,
//! a backend that refuses the request, or a store file that cannot be read
//! back as a document tree.

use thiserror::Error;

/// Errors raised by a [`DocumentStore`](super::DocumentStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failure reading or writing the backing file.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A document could not be serialized or parsed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend rejected the request (offline, quota, injected failure).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The persisted store does not have the expected shape.
    #[error("store is corrupt: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        let err = StoreError::Unavailable("write quota exceeded".into());
        assert_eq!(err.to_string(), "store unavailable: write quota exceeded");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreError>();
    }
}
