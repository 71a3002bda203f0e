use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    BenchError, Result,
    model::{Job, JobType},
    substrate::{Msg, Substrate},
};

/// Header carrying the run id on every job message.
pub const JOB_ID_HEADER: &str = "job_id";

/// Publishes jobs to their target nodes, one at a time.
pub struct Emitter {
    app: String,
    substrate: Arc<dyn Substrate>,
}

impl Emitter {
    pub fn new(
        app: &str,
        substrate: Arc<dyn Substrate>,
    ) -> Self {
        Self {
            app: app.to_string(),
            substrate,
        }
    }

    /// `<app>.<node>.<job type>`
    pub fn subject(
        app: &str,
        node_id: &str,
        job_type: JobType,
    ) -> String {
        format!("{}.{}.{}", app, node_id, job_type.as_ref())
    }

    /// Delivers every job in order and stops at the first failure.
    ///
    /// Jobs published before the failure stay delivered; their node ids are
    /// returned in `BenchError::Emission::delivered`.
    pub fn emit(
        &self,
        job_type: JobType,
        jobs: &[Job],
    ) -> Result<()> {
        if jobs.is_empty() {
            return Err(BenchError::EmptyJobSet);
        }

        let mut delivered = Vec::with_capacity(jobs.len());
        for job in jobs {
            let subject = Self::subject(&self.app, &job.node_id, job_type);
            let result = job
                .to_vec()
                .map_err(|e| BenchError::Convert(format!("unable to marshal job for node '{}': {e}", job.node_id)))
                .and_then(|data| self.substrate.publish(&Msg::new(&subject, data).with_header(JOB_ID_HEADER, job.run_id())));

            if let Err(e) = result {
                warn!("{} job for run '{}' reached {} of {} node(s)", job_type.as_ref(), job.run_id(), delivered.len(), jobs.len());
                return Err(BenchError::Emission {
                    delivered,
                    cause: format!("unable to publish to '{subject}': {e}"),
                });
            }
            debug!("published {} job to '{}'", job_type.as_ref(), subject);
            delivered.push(job.node_id.clone());
        }
        Ok(())
    }
}
