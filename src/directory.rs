//! Node directory backed by the TTL heartbeat bucket.
//!
//! A node is live while its heartbeat entry has not expired. There is no
//! explicit "node down" event: a node that stops renewing simply drops out
//! of `list_live_nodes` once the bucket TTL elapses.

use std::{sync::Arc, time::Duration};

use tokio::{runtime::Runtime, task::JoinHandle};
use tracing::{debug, error};

use crate::{BenchError, Result, common::Shutdown, model::NodeId, store::Store};

/// Opaque marker stored under each live node id.
const HEARTBEAT_MARKER: &[u8] = b"alive";

#[derive(Clone)]
pub struct Directory {
    store: Arc<Store>,
}

impl Directory {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
        }
    }

    /// Refreshes this node's presence. Idempotent.
    pub fn renew_presence(
        &self,
        node_id: &str,
    ) -> Result<()> {
        if node_id.is_empty() {
            return Err(BenchError::Validation("node id cannot be empty".into()));
        }
        self.store.heartbeats().put(node_id, HEARTBEAT_MARKER).map_err(|e| BenchError::Store(format!("unable to write heartbeat for node '{node_id}': {e}")))
    }

    /// Every node with an unexpired heartbeat, in store order. Never cached.
    pub fn list_live_nodes(&self) -> Result<Vec<NodeId>> {
        self.store.heartbeats().keys().map_err(|e| BenchError::Store(format!("unable to get heartbeat keys: {e}")))
    }

    pub fn remove_presence(
        &self,
        node_id: &str,
    ) -> Result<()> {
        if node_id.is_empty() {
            return Err(BenchError::Validation("node id cannot be empty".into()));
        }
        self.store.heartbeats().delete(node_id).map_err(|e| BenchError::Store(format!("unable to remove heartbeat for node '{node_id}': {e}")))
    }

    /// Renews `node_id` every `interval` until `shutdown` fires or a renewal fails.
    pub fn spawn_heartbeat(
        &self,
        node_id: &str,
        interval: Duration,
        runtime: &Runtime,
        shutdown: Arc<Shutdown>,
    ) -> JoinHandle<()> {
        let directory = self.clone();
        let node_id = node_id.to_string();

        runtime.spawn(async move {
            debug!("launching heartbeat for node '{}'", node_id);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = directory.renew_presence(&node_id) {
                            error!("heartbeat problem: {}", e);
                            break;
                        }
                    }
                }
            }
            debug!("heartbeat exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{MemSubstrate, Substrate};

    fn create_test_directory(ttl: Duration) -> (MemSubstrate, Directory) {
        let substrate = MemSubstrate::new();
        let store = Store::new("fleetbench", Arc::new(substrate.clone()), ttl).unwrap();
        (substrate, Directory::new(Arc::new(store)))
    }

    #[test]
    fn test_presence_lifecycle() {
        let (_, directory) = create_test_directory(Duration::from_secs(5));
        directory.renew_presence("n2").unwrap();
        directory.renew_presence("n1").unwrap();
        directory.renew_presence("n1").unwrap();
        assert_eq!(directory.list_live_nodes().unwrap(), vec!["n1".to_string(), "n2".to_string()]);

        directory.remove_presence("n1").unwrap();
        assert_eq!(directory.list_live_nodes().unwrap(), vec!["n2".to_string()]);

        assert!(matches!(directory.renew_presence(""), Err(BenchError::Validation(_))));
        assert!(matches!(directory.remove_presence(""), Err(BenchError::Validation(_))));
    }

    #[test]
    fn test_presence_expires_without_renewal() {
        let (_, directory) = create_test_directory(Duration::from_millis(40));
        directory.renew_presence("n1").unwrap();
        assert_eq!(directory.list_live_nodes().unwrap().len(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert!(directory.list_live_nodes().unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_task_renews_until_shutdown() {
        let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap();
        let (_, directory) = create_test_directory(Duration::from_millis(150));
        let shutdown = Arc::new(Shutdown::new());

        let handle = directory.spawn_heartbeat("n1", Duration::from_millis(20), &runtime, shutdown.clone());

        // outlives several TTLs only because the task keeps renewing
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(directory.list_live_nodes().unwrap(), vec!["n1".to_string()]);

        shutdown.shutdown();
        runtime.block_on(handle).unwrap();

        std::thread::sleep(Duration::from_millis(250));
        assert!(directory.list_live_nodes().unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_task_exits_on_write_failure() {
        let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap();
        let (substrate, directory) = create_test_directory(Duration::from_secs(5));
        let shutdown = Arc::new(Shutdown::new());

        substrate.delete_key_value("fleetbench-heartbeats").unwrap();
        let handle = directory.spawn_heartbeat("n1", Duration::from_millis(10), &runtime, shutdown);

        // terminates on its own, without the stop signal
        runtime.block_on(async { tokio::time::timeout(Duration::from_secs(2), handle).await }).unwrap().unwrap();
    }
}
