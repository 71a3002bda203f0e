//! Run store: settings, heartbeats and per-run status namespaces.
//!
//! Every bucket lives on the substrate under an application prefix:
//! - `<app>-heartbeats`: presence markers, entries expire after the heartbeat TTL
//! - `<app>-settings`: one Settings record per run id
//! - `<app>-results-<run id>`: one Status record per node

use std::{sync::Arc, time::Duration};

use tracing::{debug, trace};

use crate::{
    BenchError, Result,
    common::MemCache,
    model::{Settings, Status},
    substrate::{BucketConfig, KeyValue, Substrate},
};

/// Maximum number of opened buckets kept in memory.
const BUCKET_CACHE_SIZE: usize = 1024;

pub const HEARTBEAT_BUCKET: &str = "heartbeats";
pub const SETTINGS_BUCKET: &str = "settings";
pub const RESULT_BUCKET_PREFIX: &str = "results";

pub struct Store {
    app: String,
    substrate: Arc<dyn Substrate>,
    /// Opened buckets by name; populated at most once per name.
    buckets: MemCache<String, Arc<dyn KeyValue>>,
    heartbeats: Arc<dyn KeyValue>,
    settings: Arc<dyn KeyValue>,
}

impl Store {
    /// Opens the store, creating the heartbeat and settings buckets if needed.
    pub fn new(
        app: &str,
        substrate: Arc<dyn Substrate>,
        heartbeat_ttl: Duration,
    ) -> Result<Self> {
        let heartbeats = substrate
            .get_or_create_key_value(&BucketConfig::new(&format!("{app}-{HEARTBEAT_BUCKET}"), "Heartbeat bucket").with_ttl(heartbeat_ttl))
            .map_err(|e| BenchError::Store(format!("unable to create heartbeat bucket: {e}")))?;
        let settings = substrate
            .get_or_create_key_value(&BucketConfig::new(&format!("{app}-{SETTINGS_BUCKET}"), "Settings bucket"))
            .map_err(|e| BenchError::Store(format!("unable to create settings bucket: {e}")))?;

        let buckets = MemCache::new(BUCKET_CACHE_SIZE);
        buckets.set(heartbeats.name().to_string(), heartbeats.clone());
        buckets.set(settings.name().to_string(), settings.clone());

        Ok(Self {
            app: app.to_string(),
            substrate,
            buckets,
            heartbeats,
            settings,
        })
    }

    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.substrate.clone()
    }

    pub fn heartbeats(&self) -> Arc<dyn KeyValue> {
        self.heartbeats.clone()
    }

    pub fn results_bucket_name(
        &self,
        run_id: &str,
    ) -> String {
        format!("{}-{}-{}", self.app, RESULT_BUCKET_PREFIX, run_id)
    }

    /// Opens an existing bucket, consulting the cache first.
    pub fn bucket(
        &self,
        name: &str,
    ) -> Result<Arc<dyn KeyValue>> {
        if let Some(bucket) = self.buckets.get(&name.to_string()) {
            return Ok(bucket);
        }
        self.substrate.key_value(name)
    }

    fn get_or_create_results(
        &self,
        run_id: &str,
    ) -> Result<Arc<dyn KeyValue>> {
        let name = self.results_bucket_name(run_id);
        let config = BucketConfig::new(&name, &format!("results for run '{run_id}'"));
        self.buckets
            .get_or_try_insert_with(name, || self.substrate.get_or_create_key_value(&config))
            .map_err(|e| BenchError::Store(format!("unable to get bucket for run '{run_id}': {e}")))
    }

    pub fn save_settings(
        &self,
        settings: &Settings,
    ) -> Result<()> {
        trace!("store::save_settings({})", settings.id);
        if settings.id.is_empty() {
            return Err(BenchError::Validation("settings id cannot be empty".into()));
        }
        let data = serde_json::to_vec(settings).map_err(|e| BenchError::Convert(format!("unable to marshal settings to JSON: {e}")))?;
        self.settings.put(&settings.id, &data).map_err(|e| BenchError::Store(format!("unable to save settings '{}': {e}", settings.id)))
    }

    /// Reads one run's settings; a missing record is `RunNotFound`.
    pub fn get_settings(
        &self,
        id: &str,
    ) -> Result<Settings> {
        let data = match self.settings.get(id) {
            Ok(data) => data,
            Err(BenchError::KeyNotFound { .. }) => return Err(BenchError::RunNotFound(id.to_string())),
            Err(e) => return Err(BenchError::Store(format!("unable to get settings for id '{id}': {e}"))),
        };
        serde_json::from_slice::<Settings>(&data).map_err(|e| BenchError::Convert(format!("unable to unmarshal settings '{id}' from JSON: {e}")))
    }

    pub fn settings_exist(
        &self,
        id: &str,
    ) -> Result<bool> {
        match self.get_settings(id) {
            Ok(_) => Ok(true),
            Err(BenchError::RunNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn list_all_settings(&self) -> Result<Vec<Settings>> {
        let keys = self.settings.keys().map_err(|e| BenchError::Store(format!("unable to get settings keys: {e}")))?;

        let mut settings_list = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_settings(&key) {
                Ok(settings) => settings_list.push(settings),
                // deleted between listing and reading
                Err(BenchError::RunNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(settings_list)
    }

    pub fn delete_settings(
        &self,
        id: &str,
    ) -> Result<()> {
        trace!("store::delete_settings({})", id);
        self.settings.delete(id).map_err(|e| BenchError::Store(format!("unable to delete settings for id '{id}': {e}")))
    }

    /// Overwrites the reporting node's record in the run's results bucket.
    pub fn write_status(
        &self,
        status: &Status,
    ) -> Result<()> {
        if status.job_id.is_empty() {
            return Err(BenchError::Validation("job id cannot be empty".into()));
        }
        if status.node_id.is_empty() {
            return Err(BenchError::Validation("node id cannot be empty".into()));
        }

        let bucket = self.get_or_create_results(&status.job_id)?;
        let data = status.to_vec().map_err(|e| BenchError::Convert(format!("unable to marshal status for job '{}': {e}", status.job_id)))?;

        match bucket.put(&status.node_id, &data) {
            Ok(()) => Ok(()),
            Err(BenchError::BucketNotFound(name)) => {
                // dropped by a teardown since we cached it
                self.buckets.remove(&name);
                let bucket = self.get_or_create_results(&status.job_id)?;
                bucket.put(&status.node_id, &data).map_err(|e| BenchError::Store(format!("unable to write status for job '{}': {e}", status.job_id)))
            }
            Err(e) => Err(BenchError::Store(format!("unable to write status for job '{}': {e}", status.job_id))),
        }
    }

    /// Decodes every status record of a run, in bucket key order.
    ///
    /// A missing results bucket is `RunNotFound`. Any read or decode failure
    /// aborts the whole read.
    pub fn read_statuses(
        &self,
        run_id: &str,
    ) -> Result<Vec<Status>> {
        let name = self.results_bucket_name(run_id);
        let not_found = |e: BenchError| match e {
            BenchError::BucketNotFound(_) => {
                self.buckets.remove(&name);
                BenchError::RunNotFound(run_id.to_string())
            }
            e => BenchError::Store(format!("unable to read results for run '{run_id}': {e}")),
        };

        let bucket = self.bucket(&name).map_err(not_found)?;
        let keys = bucket.keys().map_err(not_found)?;

        let mut statuses = Vec::with_capacity(keys.len());
        for key in keys {
            let data = bucket.get(&key).map_err(|e| BenchError::Store(format!("unable to get k/v entry '{key}' for run '{run_id}': {e}")))?;
            let status = Status::from_slice(&data).map_err(|e| BenchError::Convert(format!("unable to unmarshal status '{key}' for run '{run_id}': {e}")))?;
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Removes the run's results bucket. Absent buckets are left alone.
    pub fn delete_results(
        &self,
        run_id: &str,
    ) -> Result<()> {
        let name = self.results_bucket_name(run_id);
        self.buckets.remove(&name);
        match self.substrate.delete_key_value(&name) {
            Ok(()) => Ok(()),
            Err(BenchError::BucketNotFound(_)) => {
                debug!("no results to delete for run '{}'", run_id);
                Ok(())
            }
            Err(e) => Err(BenchError::Store(format!("unable to delete results for job '{run_id}': {e}"))),
        }
    }
}
