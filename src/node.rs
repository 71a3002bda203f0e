//! A fleet node - the main entry point for fleetbench.
//!
//! Every process in a fleet runs one `Node`. A node can act as:
//! - a worker, once launched with a [`Workload`]: it heartbeats into the
//!   directory and executes the jobs addressed to it
//! - a coordinator, through the run API: submit, inspect and tear down runs
//!
//! Both roles can live in the same node.

mod agent;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{runtime::Runtime, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    BenchError, Config, Result,
    aggregate::Aggregator,
    common::Shutdown,
    directory::Directory,
    emitter::Emitter,
    model::{Job, JobType, NodeId, Settings, Status},
    partition::{Partitioner, ProvisionLedger},
    store::Store,
    substrate::Substrate,
    workload::Workload,
};

use agent::Agent;

/// A fleet member.
///
/// # Example
///
/// ```rust,ignore
/// let node = NodeBuilder::new().node_id("n1").build()?;
/// node.launch(Arc::new(MyWorkload))?;
///
/// let jobs = node.submit_run(&Settings::new_write("bench", WriteConfig::default()))?;
/// let status = node.get_status(jobs[0].run_id())?;
///
/// node.shutdown();
/// ```
pub struct Node {
    config: Config,
    store: Arc<Store>,
    directory: Directory,
    partitioner: Partitioner,
    emitter: Emitter,
    aggregator: Aggregator,
    agent: Agent,
    heartbeat: Mutex<Option<JoinHandle<()>>>,

    running: AtomicBool,
    runtime: Arc<Runtime>,
    // replaced on every launch, a fired signal stays fired
    shutdown: Mutex<Arc<Shutdown>>,
}

impl Node {
    /// Opens the run store on `substrate` and wires the node's parts together.
    pub fn new(
        config: Config,
        substrate: Arc<dyn Substrate>,
        runtime: Arc<Runtime>,
    ) -> Result<Self> {
        config.validate()?;

        let heartbeat_ttl = Duration::from_millis(config.heartbeat.ttl_ms);
        let store = Arc::new(Store::new(&config.app_name, substrate.clone(), heartbeat_ttl)?);
        let directory = Directory::new(store.clone());
        let partitioner = Partitioner::new(&config.app_name, &config.node_id, substrate.clone(), directory.clone());
        let emitter = Emitter::new(&config.app_name, substrate);
        let aggregator = Aggregator::new(store.clone());

        let agent = Agent::new(&config.app_name, &config.node_id, store.clone(), runtime.clone());

        Ok(Self {
            config,
            store,
            directory,
            partitioner,
            emitter,
            aggregator,
            agent,
            heartbeat: Mutex::new(None),
            running: AtomicBool::new(false),
            runtime,
            shutdown: Mutex::new(Arc::new(Shutdown::new())),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn app(&self) -> &str {
        &self.config.app_name
    }

    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.store.substrate()
    }

    /// Joins the fleet as a worker.
    ///
    /// Registers presence right away, keeps it alive in the background and
    /// starts executing jobs with `workload`. A node that was shut down can
    /// be launched again. If joining fails the node is left stopped.
    pub fn launch(
        &self,
        workload: Arc<dyn Workload>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let shutdown = Arc::new(Shutdown::new());
        *self.shutdown.lock().unwrap() = shutdown.clone();

        let joined = self.directory.renew_presence(self.node_id()).and_then(|_| self.agent.listen(workload, shutdown.clone()));
        if let Err(e) = joined {
            warn!("node '{}' failed to join '{}': {}", self.node_id(), self.app(), e);
            shutdown.shutdown();
            self.agent.stop();
            if let Err(e) = self.directory.remove_presence(self.node_id()) {
                warn!("unable to remove presence of node '{}': {}", self.node_id(), e);
            }
            self.running.store(false, Ordering::Relaxed);
            return Err(e);
        }

        let interval = Duration::from_millis(self.config.heartbeat.interval_ms);
        let handle = self.directory.spawn_heartbeat(self.node_id(), interval, &self.runtime, shutdown);
        *self.heartbeat.lock().unwrap() = Some(handle);

        info!("node '{}' joined '{}'", self.node_id(), self.app());
        Ok(())
    }

    /// Leaves the fleet: stops the heartbeat and job intake, then drops presence.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }

        self.shutdown.lock().unwrap().shutdown();
        self.agent.stop();
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
        if let Err(e) = self.directory.remove_presence(self.node_id()) {
            warn!("unable to remove presence of node '{}': {}", self.node_id(), e);
        }
        info!("node '{}' left '{}'", self.node_id(), self.app());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Starts a run: partitions it over the live nodes, emits one create job
    /// per selected node and records the settings.
    ///
    /// Nothing is rolled back on failure. A `Provision` error lists the
    /// streams left behind, see [`Node::release_streams`].
    pub fn submit_run(
        &self,
        settings: &Settings,
    ) -> Result<Vec<Job>> {
        settings.validate()?;
        if self.store.settings_exist(&settings.id)? {
            return Err(BenchError::RunExists(settings.id.clone()));
        }

        let partition = self.partitioner.partition(settings)?;
        self.emitter.emit(JobType::Create, &partition.jobs)?;
        self.store.save_settings(settings)?;

        info!("submitted run '{}' to {} node(s)", settings.id, partition.jobs.len());
        Ok(partition.jobs)
    }

    /// Aggregated status of a run.
    pub fn get_status(
        &self,
        run_id: &str,
    ) -> Result<Status> {
        self.aggregator.aggregate(run_id)
    }

    /// Tears a run down: tells every live node to release it, then deletes
    /// its settings and results.
    pub fn delete_run(
        &self,
        run_id: &str,
    ) -> Result<()> {
        let jobs = self.partitioner.delete_jobs(run_id)?;
        self.emitter.emit(JobType::Delete, &jobs)?;
        self.store.delete_settings(run_id)?;
        self.store.delete_results(run_id)?;

        info!("deleted run '{}'", run_id);
        Ok(())
    }

    pub fn list_live_nodes(&self) -> Result<Vec<NodeId>> {
        self.directory.list_live_nodes()
    }

    pub fn list_all_settings(&self) -> Result<Vec<Settings>> {
        self.store.list_all_settings()
    }

    /// Deletes the streams named in a provisioning ledger.
    pub fn release_streams(
        &self,
        ledger: &ProvisionLedger,
    ) -> Result<()> {
        let substrate = self.store.substrate();
        for stream in &ledger.streams {
            substrate.delete_stream(stream)?;
        }
        info!("released {} stream(s) of run '{}'", ledger.streams.len(), ledger.run_id);
        Ok(())
    }

    /// Overwrites this node's status record for a run.
    pub fn write_status(
        &self,
        status: &Status,
    ) -> Result<()> {
        self.store.write_status(status)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        HeartbeatConfig, NodeBuilder,
        model::{JobStatus, WriteConfig},
        substrate::{BucketConfig, KeyValue, MemSubstrate, Msg, MsgHandler, StreamConfig, StreamInfo, SubscriptionId},
        workload::JobContext,
    };

    /// Reports every assigned message as processed.
    #[derive(Default)]
    struct CountingWorkload {
        runs: Mutex<Vec<Job>>,
        releases: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Workload for CountingWorkload {
        async fn run(
            &self,
            ctx: Arc<JobContext>,
        ) -> Result<()> {
            let write = ctx.write().cloned().unwrap_or_default();
            let processed = (write.subjects.len() * write.num_messages_per_stream) as u64;
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.report(processed, 0, Vec::new())?;
            self.runs.lock().unwrap().push(ctx.job().clone());
            Ok(())
        }

        async fn release(
            &self,
            ctx: Arc<JobContext>,
        ) -> Result<()> {
            self.releases.lock().unwrap().push(ctx.run_id().to_string());
            Ok(())
        }
    }

    struct FailingWorkload;

    #[async_trait]
    impl Workload for FailingWorkload {
        async fn run(
            &self,
            _ctx: Arc<JobContext>,
        ) -> Result<()> {
            Err(BenchError::Workload("publish timed out".into()))
        }

        async fn release(
            &self,
            _ctx: Arc<JobContext>,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// Refuses subscriptions to delete subjects, otherwise behaves like `MemSubstrate`.
    #[derive(Default)]
    struct NoDeleteSubstrate {
        inner: MemSubstrate,
        subscribed: Mutex<Vec<SubscriptionId>>,
    }

    impl Substrate for NoDeleteSubstrate {
        fn key_value(
            &self,
            name: &str,
        ) -> Result<Arc<dyn KeyValue>> {
            self.inner.key_value(name)
        }

        fn get_or_create_key_value(
            &self,
            config: &BucketConfig,
        ) -> Result<Arc<dyn KeyValue>> {
            self.inner.get_or_create_key_value(config)
        }

        fn delete_key_value(
            &self,
            name: &str,
        ) -> Result<()> {
            self.inner.delete_key_value(name)
        }

        fn create_stream(
            &self,
            config: &StreamConfig,
        ) -> Result<StreamInfo> {
            self.inner.create_stream(config)
        }

        fn delete_stream(
            &self,
            name: &str,
        ) -> Result<()> {
            self.inner.delete_stream(name)
        }

        fn publish(
            &self,
            msg: &Msg,
        ) -> Result<()> {
            self.inner.publish(msg)
        }

        fn subscribe(
            &self,
            subject: &str,
            handler: MsgHandler,
        ) -> Result<SubscriptionId> {
            if subject.ends_with(".delete") {
                return Err(BenchError::Store(format!("subscribe to '{}' refused", subject)));
            }
            let id = self.inner.subscribe(subject, handler)?;
            self.subscribed.lock().unwrap().push(id);
            Ok(id)
        }

        fn unsubscribe(
            &self,
            id: SubscriptionId,
        ) -> Result<()> {
            self.subscribed.lock().unwrap().retain(|s| *s != id);
            self.inner.unsubscribe(id)
        }
    }

    fn create_test_node(
        node_id: &str,
        substrate: &MemSubstrate,
    ) -> Node {
        NodeBuilder::new().node_id(node_id).async_worker_thread_number(2).substrate(Arc::new(substrate.clone())).build().unwrap()
    }

    fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    fn write_settings(
        id: &str,
        num_streams: usize,
    ) -> Settings {
        Settings::new_write(
            "bench",
            WriteConfig {
                num_streams,
                num_messages_per_stream: 100,
                ..Default::default()
            },
        )
        .with_id(id)
    }

    #[test]
    fn test_launch_and_shutdown_presence() {
        let substrate = MemSubstrate::new();
        let node = create_test_node("n1", &substrate);
        assert!(node.list_live_nodes().unwrap().is_empty());

        node.launch(Arc::new(CountingWorkload::default())).unwrap();
        assert!(node.is_running());
        assert_eq!(node.list_live_nodes().unwrap(), vec!["n1".to_string()]);

        node.shutdown();
        assert!(!node.is_running());
        assert!(node.list_live_nodes().unwrap().is_empty());
    }

    #[test]
    fn test_relaunch_after_shutdown() {
        let substrate = MemSubstrate::new();
        let node = NodeBuilder::new()
            .config(Config {
                node_id: "n1".into(),
                async_worker_thread_number: 2,
                heartbeat: HeartbeatConfig {
                    interval_ms: 20,
                    ttl_ms: 100,
                },
                ..Default::default()
            })
            .substrate(Arc::new(substrate.clone()))
            .build()
            .unwrap();
        let workload = Arc::new(CountingWorkload::default());

        node.launch(workload.clone()).unwrap();
        node.shutdown();
        node.launch(workload.clone()).unwrap();
        assert!(node.is_running());

        // presence outlives several TTLs only if the new heartbeat is renewing
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(node.list_live_nodes().unwrap(), vec!["n1".to_string()]);

        // jobs are dispatched by the new launch
        node.submit_run(&write_settings("run1", 2)).unwrap();
        wait_until(|| node.get_status("run1").map(|s| s.status == JobStatus::Completed).unwrap_or(false));
        assert_eq!(workload.runs.lock().unwrap().len(), 1);

        node.shutdown();
    }

    #[test]
    fn test_failed_launch_leaves_node_stopped() {
        let substrate = Arc::new(NoDeleteSubstrate::default());
        let node = NodeBuilder::new().node_id("n1").async_worker_thread_number(2).substrate(substrate.clone()).build().unwrap();

        let err = node.launch(Arc::new(CountingWorkload::default())).unwrap_err();
        assert!(matches!(err, BenchError::Store(_)));
        assert!(!node.is_running());
        assert!(node.list_live_nodes().unwrap().is_empty());
        assert!(substrate.subscribed.lock().unwrap().is_empty());

        // a second attempt runs the join again instead of reporting success
        assert!(node.launch(Arc::new(CountingWorkload::default())).is_err());
        assert!(!node.is_running());
    }

    #[test]
    fn test_submit_run_round_trip() {
        let substrate = MemSubstrate::new();
        let workload = Arc::new(CountingWorkload::default());
        let worker = create_test_node("n1", &substrate);
        worker.launch(workload.clone()).unwrap();
        let coordinator = create_test_node("coordinator", &substrate);

        let settings = write_settings("run1", 3);
        let jobs = coordinator.submit_run(&settings).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(coordinator.list_all_settings().unwrap(), vec![settings.clone()]);

        wait_until(|| coordinator.get_status("run1").map(|s| s.status == JobStatus::Completed).unwrap_or(false));
        let status = coordinator.get_status("run1").unwrap();
        assert_eq!(status.total_processed, 300);
        assert_eq!(status.node_id, "n1");
        assert!(status.started_at.is_some());
        assert!(status.ended_at.is_some());

        let runs = workload.runs.lock().unwrap();
        assert_eq!(runs[0].created_by, "coordinator");
        assert_eq!(runs[0].settings.write.as_ref().unwrap().subjects, vec!["fleetbench-run1-0", "fleetbench-run1-1", "fleetbench-run1-2"]);
        drop(runs);

        worker.shutdown();
    }

    #[test]
    fn test_submit_run_across_nodes() {
        let substrate = MemSubstrate::new();
        let workload = Arc::new(CountingWorkload::default());
        let nodes = ["n1", "n2", "n3"].map(|id| create_test_node(id, &substrate));
        for node in &nodes {
            node.launch(workload.clone()).unwrap();
        }

        let jobs = nodes[0].submit_run(&write_settings("run1", 10)).unwrap();
        assert_eq!(jobs.len(), 3);

        wait_until(|| workload.runs.lock().unwrap().len() == 3);
        wait_until(|| nodes[0].get_status("run1").map(|s| s.total_processed == 1000).unwrap_or(false));

        let mut assigned = workload.runs.lock().unwrap().iter().map(|job| (job.node_id.clone(), job.settings.write.as_ref().unwrap().num_streams)).collect::<Vec<_>>();
        assigned.sort();
        assert_eq!(assigned, vec![("n1".to_string(), 3), ("n2".to_string(), 3), ("n3".to_string(), 4)]);

        for node in &nodes {
            node.shutdown();
        }
    }

    #[test]
    fn test_submit_run_rejections() {
        let substrate = MemSubstrate::new();
        let worker = create_test_node("n1", &substrate);
        worker.launch(Arc::new(CountingWorkload::default())).unwrap();

        assert!(matches!(worker.submit_run(&Settings::reference("run1")), Err(BenchError::Validation(_))));

        let mut settings = write_settings("run1", 2);
        settings.write.as_mut().unwrap().num_nodes = 2;
        assert_eq!(
            worker.submit_run(&settings),
            Err(BenchError::InsufficientNodes {
                requested: 2,
                available: 1
            })
        );
        assert!(worker.list_all_settings().unwrap().is_empty());

        worker.submit_run(&write_settings("run1", 2)).unwrap();
        assert_eq!(worker.submit_run(&write_settings("run1", 2)), Err(BenchError::RunExists("run1".into())));

        worker.shutdown();
    }

    #[test]
    fn test_read_run_has_nothing_to_emit() {
        let substrate = MemSubstrate::new();
        let worker = create_test_node("n1", &substrate);
        worker.launch(Arc::new(CountingWorkload::default())).unwrap();

        let settings = Settings::new_read(
            "read",
            crate::model::ReadConfig {
                write_id: "run0".into(),
                ..Default::default()
            },
        );
        assert_eq!(worker.submit_run(&settings), Err(BenchError::EmptyJobSet));
        worker.shutdown();
    }

    #[test]
    fn test_failed_workload_reports_errored() {
        let substrate = MemSubstrate::new();
        let worker = create_test_node("n1", &substrate);
        worker.launch(Arc::new(FailingWorkload)).unwrap();

        worker.submit_run(&write_settings("run1", 1)).unwrap();
        wait_until(|| worker.get_status("run1").map(|s| s.status == JobStatus::Errored).unwrap_or(false));

        let status = worker.get_status("run1").unwrap();
        assert_eq!(status.total_errors, 1);
        assert_eq!(status.errors, vec!["publish timed out".to_string()]);
        worker.shutdown();
    }

    #[test]
    fn test_delete_run() {
        let substrate = MemSubstrate::new();
        let workload = Arc::new(CountingWorkload::default());
        let nodes = ["n1", "n2"].map(|id| create_test_node(id, &substrate));
        for node in &nodes {
            node.launch(workload.clone()).unwrap();
        }

        nodes[0].submit_run(&write_settings("run1", 2)).unwrap();
        // a late final status would recreate the results bucket
        wait_until(|| nodes[0].store.read_statuses("run1").map(|all| all.len() == 2 && all.iter().all(Status::is_finished)).unwrap_or(false));

        nodes[0].delete_run("run1").unwrap();
        assert!(nodes[0].list_all_settings().unwrap().is_empty());
        assert_eq!(nodes[0].get_status("run1"), Err(BenchError::RunNotFound("run1".into())));

        wait_until(|| workload.releases.lock().unwrap().len() == 2);
        assert!(workload.releases.lock().unwrap().iter().all(|id| id == "run1"));

        for node in &nodes {
            node.shutdown();
        }
    }

    #[test]
    fn test_delete_run_without_nodes() {
        let substrate = MemSubstrate::new();
        let coordinator = create_test_node("coordinator", &substrate);
        assert_eq!(coordinator.delete_run("run1"), Err(BenchError::EmptyJobSet));
    }

    #[test]
    fn test_release_streams() {
        let substrate = MemSubstrate::new();
        let worker = create_test_node("n1", &substrate);
        worker.launch(Arc::new(CountingWorkload::default())).unwrap();

        worker.submit_run(&write_settings("run1", 3)).unwrap();
        assert_eq!(substrate.stream_names().len(), 3);

        let ledger = ProvisionLedger {
            run_id: "run1".into(),
            streams: substrate.stream_names(),
        };
        worker.release_streams(&ledger).unwrap();
        assert!(substrate.stream_names().is_empty());
        worker.shutdown();
    }
}
