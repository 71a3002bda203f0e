use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::{
    BenchError, Config, Node, Result, SubstrateType,
    substrate::{MemSubstrate, PostgresSubstrate, Substrate},
    utils,
};

#[derive(Default)]
pub struct NodeBuilder {
    config: Config,
    rt: Option<Arc<Runtime>>,
    substrate: Option<Arc<dyn Substrate>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(
        mut self,
        config: Config,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn node_id(
        mut self,
        node_id: &str,
    ) -> Self {
        self.config.node_id = node_id.to_string();
        self
    }

    pub fn app_name(
        mut self,
        app_name: &str,
    ) -> Self {
        self.config.app_name = app_name.to_string();
        self
    }

    pub fn async_worker_thread_number(
        mut self,
        n: u16,
    ) -> Self {
        self.config.async_worker_thread_number = n;
        self
    }

    pub fn runtime(
        mut self,
        runtime: Arc<Runtime>,
    ) -> Self {
        self.rt = Some(runtime);
        self
    }

    /// Uses an existing substrate instead of the one named in the config.
    /// Nodes sharing one `MemSubstrate` form a single in-process fleet.
    pub fn substrate(
        mut self,
        substrate: Arc<dyn Substrate>,
    ) -> Self {
        self.substrate = Some(substrate);
        self
    }

    pub fn build(self) -> Result<Node> {
        let mut config = self.config;
        if config.node_id.is_empty() {
            config.node_id = utils::shortid();
        }
        config.validate()?;

        let runtime = match self.rt {
            Some(rt) => rt,
            None => Arc::new(
                Builder::new_multi_thread()
                    .worker_threads(config.async_worker_thread_number.max(1).into())
                    .enable_all()
                    .build()
                    .map_err(|e| BenchError::IoError(format!("unable to build runtime: {e}")))?,
            ),
        };

        let substrate: Arc<dyn Substrate> = match self.substrate {
            Some(substrate) => substrate,
            None => match config.substrate.substrate_type {
                SubstrateType::Mem => Arc::new(MemSubstrate::new()),
                SubstrateType::Postgres => {
                    let pg = config.substrate.postgres.as_ref().ok_or_else(|| BenchError::Config("postgres configuration is required when substrate type is postgres".into()))?;
                    Arc::new(PostgresSubstrate::new(&pg.database_url, runtime.clone())?)
                }
            },
        };

        Node::new(config, substrate, runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults() {
        let node = NodeBuilder::new().async_worker_thread_number(1).build().unwrap();
        assert_eq!(node.app(), "fleetbench");
        assert_eq!(node.node_id().len(), 8);
        assert!(!node.is_running());
    }

    #[test]
    fn test_build_from_config() {
        let config = Config::load_from_str(
            r#"
            app_name = "njst"
            node_id = "node-a"
            async_worker_thread_number = 2
            "#,
        )
        .unwrap();
        let node = NodeBuilder::new().config(config).build().unwrap();
        assert_eq!(node.app(), "njst");
        assert_eq!(node.node_id(), "node-a");
    }

    #[test]
    fn test_build_shared_runtime() {
        let runtime = Arc::new(Builder::new_multi_thread().worker_threads(1).enable_all().build().unwrap());
        let substrate = MemSubstrate::new();
        let a = NodeBuilder::new().node_id("a").runtime(runtime.clone()).substrate(Arc::new(substrate.clone())).build().unwrap();
        let b = NodeBuilder::new().node_id("b").runtime(runtime).substrate(Arc::new(substrate.clone())).build().unwrap();
        assert_eq!(a.substrate().key_value("fleetbench-settings").unwrap().name(), b.substrate().key_value("fleetbench-settings").unwrap().name());
        assert!(substrate.bucket_exists("fleetbench-heartbeats"));
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let config = Config::load_from_str(
            r#"
            node_id = "n1"
            [substrate]
            substrate_type = "postgres"
            "#,
        )
        .unwrap();
        assert!(matches!(NodeBuilder::new().config(config).build(), Err(BenchError::Validation(_))));
    }
}
