use thiserror::Error;

/// Decode-stage failures. Downstream outcomes travel as `UpdateReason`
/// (reconciliation) and `DeliveryError` (notification), not as errors.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The whole batch is unparseable. Dead-lettered and acknowledged.
    #[error("failed to decode batch payload: {0}")]
    MalformedPayload(String),
    /// A single reading failed field validation. Skipped, batch continues.
    #[error("invalid reading: {0}")]
    InvalidReading(String),
}

/// Errors surfaced by the store collaborators (products and dedup keys).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("store call timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
