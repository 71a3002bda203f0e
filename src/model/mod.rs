mod job;
mod settings;
mod status;

pub use job::{Job, JobType, NodeId};
pub use settings::{ConsumerGroupStrategy, ReadConfig, ReadStrategy, Settings, WriteConfig};
pub use status::{JobStatus, Status};
