//! Messaging substrate seam.
//!
//! The coordinator consumes three capabilities from the substrate: durable
//! key-value namespaces (buckets), durable subject-addressed streams, and
//! publish/subscribe. Backends:
//! - `MemSubstrate`: in-process, for tests and single-process fleets
//! - `PostgresSubstrate`: tables plus LISTEN/NOTIFY, for multi-process fleets

mod mem;
mod postgres;

use std::{collections::HashMap, error::Error, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BenchError, Result};

pub use mem::MemSubstrate;
pub use postgres::PostgresSubstrate;

/// Handle returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

/// Callback invoked for every message delivered to a subscription.
pub type MsgHandler = Arc<dyn Fn(&Msg) + Send + Sync>;

/// Maps backend errors to BenchError.
fn map_db_err(err: impl Error) -> BenchError {
    BenchError::Store(err.to_string())
}

/// A published message.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Msg {
    pub subject: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub data: Vec<u8>,
}

impl Msg {
    pub fn new(
        subject: &str,
        data: Vec<u8>,
    ) -> Self {
        Self {
            subject: subject.to_string(),
            headers: HashMap::new(),
            data,
        }
    }

    pub fn with_header(
        mut self,
        key: &str,
        value: &str,
    ) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn header(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketConfig {
    pub name: String,
    pub description: String,
    /// Entries expire this long after their last put.
    pub ttl: Option<Duration>,
}

impl BucketConfig {
    pub fn new(
        name: &str,
        description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            ttl: None,
        }
    }

    pub fn with_ttl(
        mut self,
        ttl: Duration,
    ) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StorageType {
    #[default]
    Memory,
    File,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    pub description: String,
    pub subjects: Vec<String>,
    pub storage: StorageType,
    pub replicas: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
}

/// A key-value namespace.
pub trait KeyValue: Send + Sync {
    fn name(&self) -> &str;

    /// Writes or overwrites a key, restarting its TTL.
    fn put(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()>;

    /// Reads a key. Missing or expired keys are `KeyNotFound`.
    fn get(
        &self,
        key: &str,
    ) -> Result<Vec<u8>>;

    /// Removes a key. Removing a missing key is not an error.
    fn delete(
        &self,
        key: &str,
    ) -> Result<()>;

    /// Lists unexpired keys in the order the backend yields them.
    fn keys(&self) -> Result<Vec<String>>;
}

/// The messaging substrate shared by every node in the fleet.
pub trait Substrate: Send + Sync {
    /// Opens an existing bucket, `BucketNotFound` otherwise.
    fn key_value(
        &self,
        name: &str,
    ) -> Result<Arc<dyn KeyValue>>;

    /// Opens the bucket, creating it first if needed, in one conditional call.
    fn get_or_create_key_value(
        &self,
        config: &BucketConfig,
    ) -> Result<Arc<dyn KeyValue>>;

    /// Drops a bucket and all its entries, `BucketNotFound` if absent.
    fn delete_key_value(
        &self,
        name: &str,
    ) -> Result<()>;

    /// Creates a stream. Re-creating with an identical config is a no-op.
    fn create_stream(
        &self,
        config: &StreamConfig,
    ) -> Result<StreamInfo>;

    fn delete_stream(
        &self,
        name: &str,
    ) -> Result<()>;

    fn publish(
        &self,
        msg: &Msg,
    ) -> Result<()>;

    fn subscribe(
        &self,
        subject: &str,
        handler: MsgHandler,
    ) -> Result<SubscriptionId>;

    fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_headers() {
        let msg = Msg::new("fleetbench.n1.create", b"{}".to_vec()).with_header("job_id", "run1");
        assert_eq!(msg.header("job_id"), Some("run1"));
        assert_eq!(msg.header("other"), None);
    }

    #[test]
    fn test_storage_type_strings() {
        assert_eq!(StorageType::Memory.as_ref(), "memory");
        assert_eq!("file".parse::<StorageType>().unwrap(), StorageType::File);
    }
}
