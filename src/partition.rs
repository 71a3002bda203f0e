//! Job partitioner.
//!
//! Splits a write run into one job per selected node. Streams are
//! provisioned first, one at a time, and recorded in a [`ProvisionLedger`]
//! so a failure part way through names exactly what was left behind.

use std::{ops::Range, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    BenchError, Result,
    directory::Directory,
    model::{Job, NodeId, Settings, WriteConfig},
    substrate::{StorageType, StreamConfig, Substrate},
};

/// Streams created for one run, in creation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionLedger {
    pub run_id: String,
    pub streams: Vec<String>,
}

/// Output of partitioning: the jobs to emit plus what was provisioned for them.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub jobs: Vec<Job>,
    pub ledger: ProvisionLedger,
}

pub struct Partitioner {
    app: String,
    /// id of the coordinating node, stamped on every job
    node_id: NodeId,
    substrate: Arc<dyn Substrate>,
    directory: Directory,
}

impl Partitioner {
    pub fn new(
        app: &str,
        node_id: &str,
        substrate: Arc<dyn Substrate>,
        directory: Directory,
    ) -> Self {
        Self {
            app: app.to_string(),
            node_id: node_id.to_string(),
            substrate,
            directory,
        }
    }

    /// Prefix shared by every stream of a run.
    pub fn stream_prefix(
        &self,
        run_id: &str,
    ) -> String {
        format!("{}-{}", self.app, run_id)
    }

    /// Builds create jobs for either kind of settings.
    pub fn partition(
        &self,
        settings: &Settings,
    ) -> Result<Partition> {
        if settings.read.is_some() {
            self.partition_read(settings)
        } else if settings.write.is_some() {
            self.partition_write(settings)
        } else {
            Err(BenchError::Validation("settings must have either read or write set".into()))
        }
    }

    /// Read runs are not partitioned yet; no jobs are produced.
    pub fn partition_read(
        &self,
        settings: &Settings,
    ) -> Result<Partition> {
        if settings.read.is_none() {
            return Err(BenchError::Validation("unable to setup read bench without read settings".into()));
        }
        debug!("read partitioning not implemented, run '{}' gets no jobs", settings.id);
        Ok(Partition {
            jobs: Vec::new(),
            ledger: ProvisionLedger {
                run_id: settings.id.clone(),
                streams: Vec::new(),
            },
        })
    }

    pub fn partition_write(
        &self,
        settings: &Settings,
    ) -> Result<Partition> {
        let Some(write) = settings.write.as_ref() else {
            return Err(BenchError::Validation("unable to setup write bench without write settings".into()));
        };
        if write.num_streams == 0 {
            return Err(BenchError::Validation("num streams must be at least 1".into()));
        }

        let nodes = self.directory.list_live_nodes()?;
        let num_selected = select_node_count(write, nodes.len())?;

        let ledger = self.provision_streams(&settings.id, write)?;
        let ranges = assign_ranges(write.num_streams, num_selected);

        let jobs = ranges
            .into_iter()
            .zip(nodes.iter())
            .map(|(range, node)| {
                let subjects = ledger.streams[range].to_vec();
                let scoped = Settings {
                    id: settings.id.clone(),
                    description: settings.description.clone(),
                    write: Some(WriteConfig {
                        num_streams: subjects.len(),
                        num_nodes: 1,
                        subjects,
                        ..write.clone()
                    }),
                    read: None,
                };
                Job::new(node, scoped, &self.node_id)
            })
            .collect::<Vec<_>>();

        info!("partitioned run '{}': {} stream(s) across {} node(s)", settings.id, write.num_streams, jobs.len());
        Ok(Partition {
            jobs,
            ledger,
        })
    }

    /// One delete job per currently live node, carrying only the run id.
    pub fn delete_jobs(
        &self,
        run_id: &str,
    ) -> Result<Vec<Job>> {
        let nodes = self.directory.list_live_nodes()?;
        Ok(nodes.iter().map(|node| Job::new(node, Settings::reference(run_id), &self.node_id)).collect())
    }

    fn provision_streams(
        &self,
        run_id: &str,
        write: &WriteConfig,
    ) -> Result<ProvisionLedger> {
        let prefix = self.stream_prefix(run_id);
        let mut ledger = ProvisionLedger {
            run_id: run_id.to_string(),
            streams: Vec::with_capacity(write.num_streams),
        };

        for i in 0..write.num_streams {
            let stream_name = format!("{prefix}-{i}");
            let config = StreamConfig {
                name: stream_name.clone(),
                description: "fleetbench bench stream".to_string(),
                subjects: vec![stream_name.clone()],
                storage: StorageType::Memory,
                replicas: write.num_replicas.max(1),
            };

            if let Err(e) = self.substrate.create_stream(&config) {
                warn!("stream provisioning for run '{}' stopped at '{}', {} stream(s) left behind", run_id, stream_name, ledger.streams.len());
                return Err(BenchError::Provision {
                    created: ledger.streams,
                    cause: format!("unable to create stream '{stream_name}': {e}"),
                });
            }
            ledger.streams.push(stream_name);
        }
        Ok(ledger)
    }
}

/// Number of nodes that receive work, checked against the live count.
///
/// Fails before anything is provisioned.
fn select_node_count(
    write: &WriteConfig,
    live: usize,
) -> Result<usize> {
    if live == 0 {
        return Err(BenchError::NoNodesAvailable);
    }
    if write.num_nodes > live {
        return Err(BenchError::InsufficientNodes {
            requested: write.num_nodes,
            available: live,
        });
    }

    let requested = if write.num_nodes == 0 {
        live
    } else {
        write.num_nodes
    };
    // a node with zero streams is pointless
    Ok(requested.min(write.num_streams))
}

/// Splits `[0, num_streams)` into `num_nodes` contiguous ranges.
///
/// Every range but the last holds `num_streams / num_nodes` indices; the
/// last also takes the remainder.
pub fn assign_ranges(
    num_streams: usize,
    num_nodes: usize,
) -> Vec<Range<usize>> {
    if num_nodes == 0 || num_streams == 0 {
        return Vec::new();
    }
    let base = num_streams / num_nodes;
    let remainder = num_streams % num_nodes;

    let mut ranges = Vec::with_capacity(num_nodes);
    let mut start = 0;
    for i in 0..num_nodes {
        let len = if i == num_nodes - 1 {
            base + remainder
        } else {
            base
        };
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}
