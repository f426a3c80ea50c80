//! Error taxonomy at the engine's public boundary.
//!
//! Internal helpers use `anyhow::Result` for ergonomic `?`-propagation and
//! `.context(...)` annotations; only the functions exposed across the
//! Coordinator/Job Store seam return this typed enum, so callers can match on
//! a stable, small vocabulary instead of string-sniffing an error chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("data replication error: {0}")]
    Data(String),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

/// Classifies a connection-layer failure. Construction call sites know
/// whether the failure happened while dialing in, so the variant is chosen
/// there rather than inferred from the error text.
impl From<tokio_postgres::Error> for EngineError {
    fn from(err: tokio_postgres::Error) -> Self {
        EngineError::Connection(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        EngineError::Connection(err.to_string())
    }
}
