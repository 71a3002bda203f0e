use serde::{Deserialize, Serialize};

use crate::{BenchError, Result, utils};

pub const DEFAULT_NUM_STREAMS: usize = 1;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MSG_SIZE_BYTES: usize = 1024;
pub const DEFAULT_NUM_MESSAGES_PER_STREAM: usize = 10000;
pub const DEFAULT_NUM_WORKERS_PER_STREAM: usize = 1;
pub const DEFAULT_NUM_REPLICAS: usize = 1;

/// Immutable definition of one benchmark run.
///
/// Exactly one of `write` and `read` is set.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<WriteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<ReadConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteConfig {
    pub num_streams: usize,
    pub num_messages_per_stream: usize,
    pub num_workers_per_stream: usize,
    pub msg_size_bytes: usize,
    /// 0 means "every live node"
    pub num_nodes: usize,
    pub num_replicas: usize,
    pub keep_streams: bool,
    /// Assigned per node by the partitioner; ignored on submission.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadConfig {
    /// Run whose streams are read.
    #[serde(rename = "writeID")]
    pub write_id: String,
    pub num_nodes: usize,
    pub num_workers_per_stream: usize,
    pub batch_size: usize,
    pub strategy: ReadStrategy,
    pub consumer_group_strategy: ConsumerGroupStrategy,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReadStrategy {
    /// Each stream is read by exactly one node.
    #[default]
    Spread,
    /// Every node reads every stream.
    Shared,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerGroupStrategy {
    #[default]
    PerJob,
    PerStream,
    None,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            num_streams: DEFAULT_NUM_STREAMS,
            num_messages_per_stream: DEFAULT_NUM_MESSAGES_PER_STREAM,
            num_workers_per_stream: DEFAULT_NUM_WORKERS_PER_STREAM,
            msg_size_bytes: DEFAULT_MSG_SIZE_BYTES,
            num_nodes: 0,
            num_replicas: DEFAULT_NUM_REPLICAS,
            keep_streams: false,
            subjects: Vec::new(),
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            write_id: String::new(),
            num_nodes: 0,
            num_workers_per_stream: DEFAULT_NUM_WORKERS_PER_STREAM,
            batch_size: DEFAULT_BATCH_SIZE,
            strategy: ReadStrategy::default(),
            consumer_group_strategy: ConsumerGroupStrategy::default(),
        }
    }
}

impl Settings {
    /// Creates write settings under a fresh run id.
    pub fn new_write(
        description: &str,
        write: WriteConfig,
    ) -> Self {
        Self {
            id: utils::shortid(),
            description: description.to_string(),
            write: Some(write),
            read: None,
        }
    }

    /// Creates read settings under a fresh run id.
    pub fn new_read(
        description: &str,
        read: ReadConfig,
    ) -> Self {
        Self {
            id: utils::shortid(),
            description: description.to_string(),
            write: None,
            read: Some(read),
        }
    }

    /// Settings for a delete job: the run id and nothing else.
    pub fn reference(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(
        mut self,
        id: &str,
    ) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let settings = serde_json::from_str::<Settings>(s)?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(BenchError::Validation("settings id cannot be empty".into()));
        }

        match (&self.write, &self.read) {
            (None, None) => Err(BenchError::Validation("settings must have either read or write set".into())),
            (Some(_), Some(_)) => Err(BenchError::Validation("settings cannot have both read and write set".into())),
            (Some(write), None) => write.validate(),
            (None, Some(read)) => read.validate(),
        }
    }
}

impl WriteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_streams == 0 {
            return Err(BenchError::Validation("num streams must be at least 1".into()));
        }
        if self.num_messages_per_stream == 0 {
            return Err(BenchError::Validation("num messages per stream must be at least 1".into()));
        }
        if self.num_workers_per_stream == 0 {
            return Err(BenchError::Validation("num workers per stream must be at least 1".into()));
        }
        if self.msg_size_bytes == 0 {
            return Err(BenchError::Validation("msg size must be at least 1 byte".into()));
        }
        Ok(())
    }
}

impl ReadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_id.is_empty() {
            return Err(BenchError::Validation("read settings must reference a write run".into()));
        }
        if self.num_workers_per_stream == 0 {
            return Err(BenchError::Validation("num workers per stream must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(BenchError::Validation("batch size must be at least 1".into()));
        }
        Ok(())
    }
}
