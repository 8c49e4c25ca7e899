use thiserror::Error;

/// Errors that can occur while enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error("failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The insert itself failed.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}
