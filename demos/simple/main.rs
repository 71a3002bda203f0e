use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use fleetbench::{
    JobContext, NodeBuilder, Result, Settings, Workload, WriteConfig,
    substrate::{MemSubstrate, Msg},
};
use tracing_subscriber::EnvFilter;

/// Publishes every assigned stream's messages and drops the streams on release.
#[derive(Default)]
struct PublishWorkload {
    owned: Mutex<HashMap<String, WriteConfig>>,
}

#[async_trait]
impl Workload for PublishWorkload {
    async fn run(
        &self,
        ctx: Arc<JobContext>,
    ) -> Result<()> {
        let Some(write) = ctx.write().cloned() else {
            return Ok(());
        };
        self.owned.lock().unwrap().insert(ctx.run_id().to_string(), write.clone());

        let substrate = ctx.substrate();
        let payload = vec![b'x'; write.msg_size_bytes];
        let mut processed = 0;
        let mut errors = Vec::new();

        for subject in &write.subjects {
            for _ in 0..write.num_messages_per_stream {
                match substrate.publish(&Msg::new(subject, payload.clone())) {
                    Ok(()) => processed += 1,
                    Err(e) => errors.push(e.to_string()),
                }
            }
            ctx.report(processed, errors.len() as u64, errors.clone())?;
        }
        Ok(())
    }

    async fn release(
        &self,
        ctx: Arc<JobContext>,
    ) -> Result<()> {
        let Some(write) = self.owned.lock().unwrap().remove(ctx.run_id()) else {
            return Ok(());
        };
        if write.keep_streams {
            return Ok(());
        }
        let substrate = ctx.substrate();
        for subject in &write.subjects {
            substrate.delete_stream(subject)?;
        }
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let substrate = Arc::new(MemSubstrate::new());
    let workload = Arc::new(PublishWorkload::default());

    let nodes = ["node-a", "node-b", "node-c"].map(|id| NodeBuilder::new().node_id(id).async_worker_thread_number(2).substrate(substrate.clone()).build().unwrap());
    for node in &nodes {
        node.launch(workload.clone()).unwrap();
    }
    let coordinator = &nodes[0];
    println!("Live nodes: {:?}", coordinator.list_live_nodes().unwrap());

    let settings = Settings::new_write(
        "demo write run",
        WriteConfig {
            num_streams: 10,
            num_messages_per_stream: 1000,
            ..Default::default()
        },
    );
    let jobs = coordinator.submit_run(&settings).unwrap();
    println!("Run {} submitted as {} job(s)", settings.id, jobs.len());

    loop {
        if let Ok(status) = coordinator.get_status(&settings.id)
            && status.total_processed == 10 * 1000
        {
            println!("Status: {:#?}", status);
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    coordinator.delete_run(&settings.id).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    println!("Streams left: {:?}", substrate.stream_names());

    for node in &nodes {
        node.shutdown();
    }
}
