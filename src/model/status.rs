use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, model::NodeId};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Running,
    Completed,
    Errored,
}

/// One node's self-reported progress for a run.
///
/// Stored under the node id in the run's results bucket and only ever
/// written by that node.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Status {
    #[serde(rename = "jobID")]
    pub job_id: String,
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    pub total_processed: u64,
    pub total_errors: u64,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    pub avg_msg_per_sec: f64,
    pub message: String,
    pub status: JobStatus,
}

impl Status {
    pub fn new(
        job_id: &str,
        node_id: &str,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Errored)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice::<Status>(data)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_field_names() {
        let mut status = Status::new("run1", "node-a");
        status.total_processed = 10;
        status.status = JobStatus::Completed;

        let value: serde_json::Value = serde_json::from_slice(&status.to_vec().unwrap()).unwrap();
        assert_eq!(value["jobID"], "run1");
        assert_eq!(value["nodeID"], "node-a");
        assert_eq!(value["totalProcessed"], 10);
        assert_eq!(value["status"], "completed");
        assert!(value["startedAt"].is_null());
        assert!(status.is_finished());
    }

    #[test]
    fn test_partial_record_decodes() {
        let status = Status::from_slice(br#"{"jobID":"run1","nodeID":"n1","totalProcessed":5}"#).unwrap();
        assert_eq!(status.total_processed, 5);
        assert!(status.errors.is_empty());
        assert_eq!(status.status, JobStatus::Running);
        assert!(!status.is_finished());
    }
}
