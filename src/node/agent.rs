use std::sync::{Arc, RwLock};

use strum::IntoEnumIterator;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::{
    Result, ShareLock,
    common::{Queue, Shutdown},
    emitter::Emitter,
    model::{Job, JobType},
    store::Store,
    substrate::{Msg, Substrate, SubscriptionId},
    workload::{JobContext, Workload},
};

/// Size of the queue between subscription handlers and the dispatch task.
const JOB_QUEUE_SIZE: usize = 1024;

/// Worker side of a node: receives jobs addressed to it and runs them.
pub struct Agent {
    app: String,
    node_id: String,
    store: Arc<Store>,
    substrate: Arc<dyn Substrate>,
    queue: Arc<Queue<(JobType, Job)>>,
    subscriptions: ShareLock<Vec<SubscriptionId>>,

    runtime: Arc<Runtime>,
}

impl Agent {
    pub fn new(
        app: &str,
        node_id: &str,
        store: Arc<Store>,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            app: app.to_string(),
            node_id: node_id.to_string(),
            substrate: store.substrate(),
            store,
            queue: Queue::new(JOB_QUEUE_SIZE),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            runtime,
        }
    }

    /// Subscribes to this node's job subjects and starts dispatching to
    /// `workload` until `shutdown` fires.
    pub fn listen(
        &self,
        workload: Arc<dyn Workload>,
        shutdown: Arc<Shutdown>,
    ) -> Result<()> {
        // dispatcher first so nothing queued waits on a missing consumer
        self.dispatch(workload, shutdown);

        for job_type in JobType::iter() {
            let subject = Emitter::subject(&self.app, &self.node_id, job_type);
            let queue = self.queue.clone();
            let node_id = self.node_id.clone();

            let id = self.substrate.subscribe(
                &subject,
                Arc::new(move |msg: &Msg| match Job::from_slice(&msg.data) {
                    Ok(job) if job.node_id != node_id => {
                        warn!("dropping job for node '{}' received on '{}'", job.node_id, msg.subject);
                    }
                    Ok(job) => {
                        if let Err(e) = queue.send((job_type, job)) {
                            error!("unable to queue job from '{}': {}", msg.subject, e);
                        }
                    }
                    Err(e) => warn!("dropping malformed job on '{}': {}", msg.subject, e),
                }),
            )?;
            debug!("node '{}' listening on '{}'", self.node_id, subject);
            self.subscriptions.write().unwrap().push(id);
        }
        Ok(())
    }

    fn dispatch(
        &self,
        workload: Arc<dyn Workload>,
        shutdown: Arc<Shutdown>,
    ) {
        let queue = self.queue.clone();
        let store = self.store.clone();
        let node_id = self.node_id.clone();
        let runtime = self.runtime.clone();

        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    Some((job_type, job)) = queue.next_async() => {
                        let ctx = Arc::new(JobContext::new(&node_id, job, store.clone()));
                        runtime.spawn(handle(job_type, ctx, workload.clone()));
                    }
                }
            }
            debug!("dispatcher for node '{}' exiting", node_id);
        });
    }

    /// Drops every subscription. Jobs already running are left to finish.
    pub fn stop(&self) {
        let ids = std::mem::take(&mut *self.subscriptions.write().unwrap());
        for id in ids {
            if let Err(e) = self.substrate.unsubscribe(id) {
                warn!("unable to unsubscribe {}: {}", id, e);
            }
        }
    }
}

async fn handle(
    job_type: JobType,
    ctx: Arc<JobContext>,
    workload: Arc<dyn Workload>,
) {
    match job_type {
        JobType::Create => {
            info!("node '{}' starting run '{}'", ctx.node_id(), ctx.run_id());
            if let Err(e) = ctx.begin() {
                error!("unable to write status for run '{}': {}", ctx.run_id(), e);
            }
            let result = workload.run(ctx.clone()).await;
            if let Err(e) = &result {
                warn!("run '{}' failed on node '{}': {}", ctx.run_id(), ctx.node_id(), e);
            }
            if let Err(e) = ctx.finish(&result) {
                error!("unable to write status for run '{}': {}", ctx.run_id(), e);
            }
        }
        JobType::Delete => {
            info!("node '{}' releasing run '{}'", ctx.node_id(), ctx.run_id());
            if let Err(e) = workload.release(ctx.clone()).await {
                error!("unable to release run '{}': {}", ctx.run_id(), e);
            }
        }
    }
}
