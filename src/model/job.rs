use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, model::Settings};

pub type NodeId = String;

/// What a job asks its target node to do. The string form is the last
/// token of the job subject.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    Create,
    Delete,
}

/// Transient instruction for one node. Never persisted.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    pub settings: Settings,
    pub created_by: NodeId,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        node_id: &str,
        settings: Settings,
        created_by: &str,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            settings,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.settings.id
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice::<Job>(data)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WriteConfig;

    #[test]
    fn test_envelope_field_names() {
        let settings = Settings::new_write("bench", WriteConfig::default()).with_id("run1");
        let job = Job::new("node-b", settings, "node-a");
        let value: serde_json::Value = serde_json::from_slice(&job.to_vec().unwrap()).unwrap();

        assert_eq!(value["nodeID"], "node-b");
        assert_eq!(value["createdBy"], "node-a");
        assert_eq!(value["settings"]["id"], "run1");
        assert!(value["settings"]["write"].is_object());
        assert!(value["settings"].get("read").is_none());
        assert!(value["createdAt"].is_string());

        let decoded = Job::from_slice(&job.to_vec().unwrap()).unwrap();
        assert_eq!(decoded.run_id(), "run1");
        assert_eq!(decoded.created_at, job.created_at);
    }

    #[test]
    fn test_job_type_subject_token() {
        assert_eq!(JobType::Create.as_ref(), "create");
        assert_eq!(JobType::Delete.as_ref(), "delete");
    }
}
