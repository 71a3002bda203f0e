//! Error types for fleetbench.
//!
//! All errors are represented by the `BenchError` enum. Substrate failures
//! are flattened into strings that already carry the resource, key or
//! subject involved, so the enum stays `Clone` and serializable.

use std::{io::ErrorKind, string::FromUtf8Error};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all fleetbench operations.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq)]
pub enum BenchError {
    /// Invalid input: missing settings, empty node id, bad transport address.
    #[error("{0}")]
    Validation(String),

    /// Configuration parsing errors.
    #[error("{0}")]
    Config(String),

    /// Data conversion errors (JSON, UTF-8).
    #[error("{0}")]
    Convert(String),

    /// Key-value or stream operation errors.
    #[error("{0}")]
    Store(String),

    /// Publish or subscribe errors.
    #[error("{0}")]
    Publish(String),

    /// More nodes were requested than are currently live.
    #[error("{requested} nodes requested but only {available} available")]
    InsufficientNodes {
        requested: usize,
        available: usize,
    },

    /// The node directory is empty.
    #[error("no live nodes available")]
    NoNodesAvailable,

    /// Emit was called without any jobs.
    #[error("jobs are empty - nothing to emit")]
    EmptyJobSet,

    /// The run has no results namespace or no status records.
    #[error("run '{0}' not found")]
    RunNotFound(String),

    /// A settings record already exists for this run id.
    #[error("run '{0}' already exists")]
    RunExists(String),

    /// The named key-value namespace does not exist.
    #[error("bucket '{0}' not found")]
    BucketNotFound(String),

    /// The key does not exist (or has expired) in its namespace.
    #[error("key '{key}' not found in bucket '{bucket}'")]
    KeyNotFound {
        bucket: String,
        key: String,
    },

    /// Stream provisioning failed partway; `created` lists the streams left behind.
    #[error("stream provisioning failed after creating {} stream(s): {cause}", created.len())]
    Provision {
        created: Vec<String>,
        cause: String,
    },

    /// Job emission failed partway; `delivered` lists the nodes already notified.
    #[error("job emission failed after notifying {} node(s): {cause}", delivered.len())]
    Emission {
        delivered: Vec<String>,
        cause: String,
    },

    /// Message queue errors.
    #[error("{0}")]
    Queue(String),

    /// Errors returned by a workload.
    #[error("{0}")]
    Workload(String),

    /// I/O operation errors.
    #[error("{0}")]
    IoError(String),
}

impl BenchError {
    /// Returns true when the error means "the thing is not there".
    pub fn is_not_found(&self) -> bool {
        matches!(self, BenchError::RunNotFound(_) | BenchError::BucketNotFound(_) | BenchError::KeyNotFound { .. })
    }
}

impl From<BenchError> for String {
    fn from(val: BenchError) -> Self {
        val.to_string()
    }
}

impl From<std::io::Error> for BenchError {
    fn from(error: std::io::Error) -> Self {
        BenchError::IoError(error.to_string())
    }
}

impl From<BenchError> for std::io::Error {
    fn from(val: BenchError) -> Self {
        #[allow(clippy::io_other_error)]
        std::io::Error::new(ErrorKind::Other, val.to_string())
    }
}

impl From<FromUtf8Error> for BenchError {
    fn from(_: FromUtf8Error) -> Self {
        BenchError::Convert("Error with utf-8 string convert".to_string())
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(error: serde_json::Error) -> Self {
        BenchError::Convert(error.to_string())
    }
}

impl From<toml::de::Error> for BenchError {
    fn from(error: toml::de::Error) -> Self {
        BenchError::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_errors_report_counts() {
        let err = BenchError::Provision {
            created: vec!["fleetbench-run1-0".to_string(), "fleetbench-run1-1".to_string()],
            cause: "disk full".to_string(),
        };
        assert_eq!(err.to_string(), "stream provisioning failed after creating 2 stream(s): disk full");

        let err = BenchError::Emission {
            delivered: vec!["n1".to_string()],
            cause: "closed".to_string(),
        };
        assert_eq!(err.to_string(), "job emission failed after notifying 1 node(s): closed");
    }

    #[test]
    fn test_not_found_classification() {
        assert!(BenchError::RunNotFound("r".into()).is_not_found());
        assert!(BenchError::BucketNotFound("b".into()).is_not_found());
        assert!(!BenchError::EmptyJobSet.is_not_found());
    }
}
