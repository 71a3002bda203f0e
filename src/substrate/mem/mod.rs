mod bucket;

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use globset::{GlobBuilder, GlobMatcher};
use tracing::trace;

use crate::{
    BenchError, Result, ShareLock,
    substrate::{BucketConfig, KeyValue, Msg, MsgHandler, StreamConfig, StreamInfo, Substrate, SubscriptionId},
    utils,
};

pub use bucket::MemBucket;

struct Subscription {
    id: SubscriptionId,
    matcher: GlobMatcher,
    handler: MsgHandler,
}

/// In-process substrate.
///
/// Clones share state, so several nodes built on clones of one
/// `MemSubstrate` form a fleet. Delivery is synchronous: `publish` returns
/// after every matching handler has run.
#[derive(Clone)]
pub struct MemSubstrate {
    buckets: ShareLock<HashMap<String, Arc<MemBucket>>>,
    streams: ShareLock<HashMap<String, StreamInfo>>,
    subscriptions: ShareLock<Vec<Subscription>>,
    next_sub_id: Arc<AtomicU64>,
}

impl Default for MemSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl MemSubstrate {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            streams: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_sub_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Names of the streams that currently exist, sorted.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names = self.streams.read().unwrap().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn stream(
        &self,
        name: &str,
    ) -> Option<StreamInfo> {
        self.streams.read().unwrap().get(name).cloned()
    }

    pub fn bucket_exists(
        &self,
        name: &str,
    ) -> bool {
        self.buckets.read().unwrap().contains_key(name)
    }
}

/// Compiles a subject pattern. `*` matches one token and `>` the rest.
fn subject_matcher(subject: &str) -> Result<GlobMatcher> {
    if subject.is_empty() {
        return Err(BenchError::Validation("subject cannot be empty".into()));
    }
    let pattern = subject.replace('.', "/").replace('>', "**");
    let glob = GlobBuilder::new(&pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| BenchError::Validation(format!("invalid subject '{subject}': {e}")))?;
    Ok(glob.compile_matcher())
}

impl Substrate for MemSubstrate {
    fn key_value(
        &self,
        name: &str,
    ) -> Result<Arc<dyn KeyValue>> {
        let buckets = self.buckets.read().unwrap();
        match buckets.get(name) {
            Some(bucket) => Ok(bucket.clone()),
            None => Err(BenchError::BucketNotFound(name.to_string())),
        }
    }

    fn get_or_create_key_value(
        &self,
        config: &BucketConfig,
    ) -> Result<Arc<dyn KeyValue>> {
        if config.name.is_empty() {
            return Err(BenchError::Validation("bucket name cannot be empty".into()));
        }
        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets.entry(config.name.clone()).or_insert_with(|| {
            trace!("mem::create_bucket({})", config.name);
            Arc::new(MemBucket::new(&config.name, config.ttl))
        });
        Ok(bucket.clone())
    }

    fn delete_key_value(
        &self,
        name: &str,
    ) -> Result<()> {
        let removed = self.buckets.write().unwrap().remove(name);
        match removed {
            Some(bucket) => {
                bucket.mark_deleted();
                Ok(())
            }
            None => Err(BenchError::BucketNotFound(name.to_string())),
        }
    }

    fn create_stream(
        &self,
        config: &StreamConfig,
    ) -> Result<StreamInfo> {
        if config.name.is_empty() {
            return Err(BenchError::Validation("stream name cannot be empty".into()));
        }
        let mut streams = self.streams.write().unwrap();
        if let Some(existing) = streams.get(&config.name) {
            if existing.config == *config {
                return Ok(existing.clone());
            }
            return Err(BenchError::Store(format!("stream '{}' already exists with a different config", config.name)));
        }

        let info = StreamInfo {
            config: config.clone(),
            created: utils::time::now(),
        };
        streams.insert(config.name.clone(), info.clone());
        Ok(info)
    }

    fn delete_stream(
        &self,
        name: &str,
    ) -> Result<()> {
        match self.streams.write().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(BenchError::Store(format!("stream '{name}' not found"))),
        }
    }

    fn publish(
        &self,
        msg: &Msg,
    ) -> Result<()> {
        if msg.subject.is_empty() {
            return Err(BenchError::Publish("subject cannot be empty".into()));
        }
        let path = msg.subject.replace('.', "/");
        let handlers = {
            let subscriptions = self.subscriptions.read().unwrap();
            subscriptions.iter().filter(|s| s.matcher.is_match(&path)).map(|s| s.handler.clone()).collect::<Vec<_>>()
        };
        for handler in handlers {
            (handler)(msg);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        subject: &str,
        handler: MsgHandler,
    ) -> Result<SubscriptionId> {
        let matcher = subject_matcher(subject)?;
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.write().unwrap().push(Subscription {
            id,
            matcher,
            handler,
        });
        Ok(id)
    }

    fn unsubscribe(
        &self,
        id: SubscriptionId,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().unwrap();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        if subscriptions.len() == before {
            return Err(BenchError::Publish(format!("subscription {id} not found")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::substrate::StorageType;

    fn collector() -> (Arc<Mutex<Vec<String>>>, MsgHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MsgHandler = Arc::new(move |msg: &Msg| sink.lock().unwrap().push(msg.subject.clone()));
        (seen, handler)
    }

    #[test]
    fn test_bucket_lifecycle() {
        let substrate = MemSubstrate::new();
        assert!(matches!(substrate.key_value("b"), Err(BenchError::BucketNotFound(_))));

        let kv = substrate.get_or_create_key_value(&BucketConfig::new("b", "test")).unwrap();
        kv.put("k", b"v").unwrap();

        // second create converges on the same bucket
        let again = substrate.get_or_create_key_value(&BucketConfig::new("b", "test")).unwrap();
        assert_eq!(again.get("k").unwrap(), b"v".to_vec());

        substrate.delete_key_value("b").unwrap();
        assert!(!substrate.bucket_exists("b"));
        assert!(kv.keys().is_err());
        assert!(matches!(substrate.delete_key_value("b"), Err(BenchError::BucketNotFound(_))));
    }

    #[test]
    fn test_streams() {
        let substrate = MemSubstrate::new();
        let config = StreamConfig {
            name: "s-0".into(),
            description: "bench".into(),
            subjects: vec!["s-0".into()],
            storage: StorageType::Memory,
            replicas: 3,
        };
        substrate.create_stream(&config).unwrap();
        substrate.create_stream(&config).unwrap();
        assert_eq!(substrate.stream("s-0").unwrap().config.replicas, 3);

        let conflicting = StreamConfig {
            replicas: 1,
            ..config.clone()
        };
        assert!(substrate.create_stream(&conflicting).is_err());

        substrate.delete_stream("s-0").unwrap();
        assert!(substrate.stream_names().is_empty());
        assert!(substrate.delete_stream("s-0").is_err());
    }

    #[test]
    fn test_subject_routing() {
        let substrate = MemSubstrate::new();
        let (exact, exact_handler) = collector();
        let (star, star_handler) = collector();
        let (tail, tail_handler) = collector();

        substrate.subscribe("app.n1.create", exact_handler).unwrap();
        let star_id = substrate.subscribe("app.*.create", star_handler).unwrap();
        substrate.subscribe("app.>", tail_handler).unwrap();

        substrate.publish(&Msg::new("app.n1.create", vec![])).unwrap();
        substrate.publish(&Msg::new("app.n2.create", vec![])).unwrap();
        substrate.publish(&Msg::new("app.n1.delete", vec![])).unwrap();

        assert_eq!(*exact.lock().unwrap(), vec!["app.n1.create"]);
        assert_eq!(*star.lock().unwrap(), vec!["app.n1.create", "app.n2.create"]);
        assert_eq!(tail.lock().unwrap().len(), 3);

        substrate.unsubscribe(star_id).unwrap();
        substrate.publish(&Msg::new("app.n3.create", vec![])).unwrap();
        assert_eq!(star.lock().unwrap().len(), 2);
        assert!(substrate.unsubscribe(star_id).is_err());
    }
}
