//! Error types for SlotDB

use thiserror::Error;

/// Result type alias for SlotDB operations
pub type Result<T> = std::result::Result<T, SlotError>;

/// SlotDB error types
#[derive(Error, Debug)]
pub enum SlotError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// File written by an unknown format version
    #[error("Unsupported version {version} in {what}")]
    UnsupportedVersion { what: &'static str, version: u16 },

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation canceled through its cancellation token
    #[error("Operation canceled")]
    Canceled,

    /// Operation exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Shard reached `max_series_ids`
    #[error("Series limit exceeded: shard holds {limit} series ids")]
    SeriesLimitExceeded { limit: u32 },

    /// Metric reached `max_tag_keys`
    #[error("Tag keys limit exceeded for metric {metric_id}: limit {limit}")]
    TagKeysLimitExceeded { metric_id: u32, limit: usize },

    /// Too many memdb instances alive
    #[error("MemDB limit exceeded: {0}")]
    MemDbLimit(String),

    /// Peer broke the replication protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Bounded queue is full
    #[error("Queue full")]
    QueueFull,

    /// Component already closed
    #[error("Closed: {0}")]
    Closed(String),

    /// Caller gave up waiting for the write channel
    #[error("Ingest timeout")]
    IngestTimeout,

    /// Family write channel was stopped
    #[error("Family channel canceled")]
    FamilyChannelCanceled,

    /// Timestamp outside of the shard acceptance window
    #[error("Timestamp {timestamp} out of accept range [{start}, {end}]")]
    OutOfAcceptRange { timestamp: i64, start: i64, end: i64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SlotError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SlotError::Io(_) | SlotError::Timeout | SlotError::QueueFull
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SlotError::Corruption(_)
                | SlotError::ChecksumMismatch { .. }
                | SlotError::UnsupportedVersion { .. }
        )
    }

    /// Check if error comes from a resource limit
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            SlotError::SeriesLimitExceeded { .. }
                | SlotError::TagKeysLimitExceeded { .. }
                | SlotError::MemDbLimit(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(SlotError::Io(std::io::Error::other("x")).is_retryable());
        assert!(SlotError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
        assert!(SlotError::UnsupportedVersion { what: "sst", version: 9 }.is_corruption());
        assert!(SlotError::SeriesLimitExceeded { limit: 10 }.is_resource_limit());
        assert!(!SlotError::Canceled.is_retryable());
    }
}
