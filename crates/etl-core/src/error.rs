use etl_schema::SchemaError;

/// The error taxonomy every operator reports through.
///
/// Disposition is mechanical given the variant: `Configuration` aborts
/// pipeline startup, `Transient` is retried with backoff by the caller,
/// `EventLevel` is logged, counted and the offending event dropped, and
/// `Fatal` stops the operator and is escalated to the pipeline manager.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient error: {0}")]
    Transient(#[from] anyhow::Error),

    #[error("event-level error: {0}")]
    EventLevel(#[from] SchemaError),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl EtlError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EtlError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EtlError::Fatal(_))
    }
}

pub type EtlResult<T> = Result<T, EtlError>;
