use std::{
    collections::BTreeMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{BenchError, Result, ShareLock, substrate::KeyValue, utils};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    /// millis since epoch, `None` for buckets without a TTL
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(
        &self,
        now: i64,
    ) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory bucket. Keys are yielded in sorted order.
#[derive(Debug)]
pub struct MemBucket {
    name: String,
    ttl: Option<Duration>,
    entries: ShareLock<BTreeMap<String, Entry>>,
    deleted: AtomicBool,
}

impl MemBucket {
    pub fn new(
        name: &str,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_string(),
            ttl,
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            deleted: AtomicBool::new(false),
        }
    }

    /// Marks the bucket dropped; handles still held by callers start failing.
    pub(super) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.entries.write().unwrap().clear();
    }

    fn check(&self) -> Result<()> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(BenchError::BucketNotFound(self.name.clone()));
        }
        Ok(())
    }
}

impl KeyValue for MemBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(
        &self,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        self.check()?;
        let now = utils::time::time_millis();
        let expires_at = self.ttl.map(|ttl| now + ttl.as_millis() as i64);

        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(
        &self,
        key: &str,
    ) -> Result<Vec<u8>> {
        self.check()?;
        let now = utils::time::time_millis();
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(entry.value.clone()),
            _ => Err(BenchError::KeyNotFound {
                bucket: self.name.clone(),
                key: key.to_string(),
            }),
        }
    }

    fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.check()?;
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.check()?;
        let now = utils::time::time_millis();
        let entries = self.entries.read().unwrap();
        Ok(entries.iter().filter(|(_, e)| e.is_live(now)).map(|(k, _)| k.clone()).collect())
    }
}
