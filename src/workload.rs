//! Worker-side extension point.
//!
//! A [`Workload`] is what a node actually does when it receives a job: for a
//! write run, publish messages to its assigned streams; for a delete job,
//! tear down whatever it owns for the run. The node agent drives it and
//! keeps the node's Status record current around each call.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{
    Result,
    model::{Job, JobStatus, Settings, Status, WriteConfig},
    store::Store,
    substrate::Substrate,
    utils,
};

#[async_trait]
pub trait Workload: Send + Sync {
    /// Executes a create job.
    ///
    /// Progress is reported through [`JobContext::report`]. Returning an
    /// error marks the node's Status as `errored`.
    async fn run(
        &self,
        ctx: Arc<JobContext>,
    ) -> Result<()>;

    /// Releases everything this node holds for the job's run.
    async fn release(
        &self,
        ctx: Arc<JobContext>,
    ) -> Result<()>;
}

/// Handle a workload gets for one job.
pub struct JobContext {
    node_id: String,
    job: Job,
    store: Arc<Store>,
    substrate: Arc<dyn Substrate>,
    status: RwLock<Status>,
}

impl JobContext {
    pub(crate) fn new(
        node_id: &str,
        job: Job,
        store: Arc<Store>,
    ) -> Self {
        let status = Status::new(job.run_id(), node_id);
        Self {
            node_id: node_id.to_string(),
            substrate: store.substrate(),
            job,
            store,
            status: RwLock::new(status),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn run_id(&self) -> &str {
        self.job.run_id()
    }

    pub fn settings(&self) -> &Settings {
        &self.job.settings
    }

    /// The node-scoped write config, if this is a write job.
    pub fn write(&self) -> Option<&WriteConfig> {
        self.job.settings.write.as_ref()
    }

    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.substrate.clone()
    }

    /// Snapshot of the last status written for this job.
    pub fn status(&self) -> Status {
        self.status.read().unwrap().clone()
    }

    /// Overwrites the node's Status with cumulative progress.
    pub fn report(
        &self,
        processed: u64,
        errors: u64,
        error_messages: Vec<String>,
    ) -> Result<()> {
        let status = {
            let mut status = self.status.write().unwrap();
            status.total_processed = processed;
            status.total_errors = errors;
            status.errors = error_messages;
            refresh_rate(&mut status);
            status.clone()
        };
        self.store.write_status(&status)
    }

    pub(crate) fn begin(&self) -> Result<()> {
        let status = {
            let mut status = self.status.write().unwrap();
            status.started_at = Some(utils::time::now());
            status.status = JobStatus::Running;
            status.message = format!("running on node '{}'", self.node_id);
            status.clone()
        };
        self.store.write_status(&status)
    }

    pub(crate) fn finish(
        &self,
        result: &Result<()>,
    ) -> Result<()> {
        let status = {
            let mut status = self.status.write().unwrap();
            status.ended_at = Some(utils::time::now());
            refresh_rate(&mut status);
            match result {
                Ok(()) => {
                    status.status = JobStatus::Completed;
                    status.message = format!("completed on node '{}'", self.node_id);
                }
                Err(e) => {
                    status.status = JobStatus::Errored;
                    status.message = format!("errored on node '{}'", self.node_id);
                    status.total_errors += 1;
                    status.errors.push(e.to_string());
                }
            }
            status.clone()
        };
        self.store.write_status(&status)
    }
}

fn refresh_rate(status: &mut Status) {
    let Some(started_at) = status.started_at else {
        return;
    };
    let until = status.ended_at.unwrap_or_else(utils::time::now);
    status.elapsed_seconds = utils::time::elapsed_seconds(started_at, until);
    status.avg_msg_per_sec = if status.elapsed_seconds > 0.0 {
        status.total_processed as f64 / status.elapsed_seconds
    } else {
        0.0
    };
}
