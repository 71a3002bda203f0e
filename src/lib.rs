//! # Fleetbench
//!
//! Fleetbench coordinates load-generation benchmarks across a fleet of
//! nodes that share one messaging substrate.
//!
//! ## Core Features
//!
//! - **Node Directory**: Nodes announce themselves with TTL heartbeats; liveness is simply "heartbeat not expired"
//! - **Job Partitioning**: A write run's streams are provisioned and split into contiguous ranges across live nodes
//! - **Job Emission**: Each node receives its job on its own subject, delivered sequentially
//! - **Status Aggregation**: Per-node status records are folded into one run summary
//! - **Pluggable Substrate**: In-memory (testing, single process) and PostgreSQL (multi-process)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleetbench::{NodeBuilder, Settings, WriteConfig};
//!
//! let node = NodeBuilder::new().node_id("n1").build()?;
//! node.launch(Arc::new(MyWorkload))?;
//!
//! let settings = Settings::new_write("bench", WriteConfig { num_streams: 4, ..Default::default() });
//! node.submit_run(&settings)?;
//! let status = node.get_status(&settings.id)?;
//! node.delete_run(&settings.id)?;
//! ```

mod aggregate;
mod builder;
mod common;
mod config;
mod directory;
mod emitter;
mod error;
mod model;
mod node;
mod partition;
mod store;
mod utils;
mod workload;

pub mod substrate;

use std::sync::{Arc, RwLock};

pub use aggregate::fold_statuses;
pub use builder::NodeBuilder;
pub use config::*;
pub use emitter::JOB_ID_HEADER;
pub use error::BenchError;
pub use model::*;
pub use node::Node;
pub use partition::{ProvisionLedger, assign_ranges};
pub use workload::{JobContext, Workload};

/// Result type alias for fleetbench operations.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Thread-safe shared lock wrapper using Arc<RwLock<T>>.
pub(crate) type ShareLock<T> = Arc<RwLock<T>>;
