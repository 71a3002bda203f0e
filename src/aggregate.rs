//! Status aggregation.
//!
//! Folds the per-node Status records of a run into one summary. The fold
//! runs in store key order and several fields depend on that order:
//! `job_id`, `node_id`, `message` and `status` are taken from the last
//! record, and `avg_msg_per_sec` is a running pairwise average.

use std::sync::Arc;

use tracing::trace;

use crate::{BenchError, Result, model::Status, store::Store};

pub struct Aggregator {
    store: Arc<Store>,
}

impl Aggregator {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
        }
    }

    /// Summarizes a run. A run without any status record is `RunNotFound`.
    pub fn aggregate(
        &self,
        run_id: &str,
    ) -> Result<Status> {
        trace!("aggregator::aggregate({})", run_id);
        let statuses = self.store.read_statuses(run_id)?;
        fold_statuses(statuses).ok_or_else(|| BenchError::RunNotFound(run_id.to_string()))
    }
}

/// Folds status records in iteration order. `None` for an empty input.
pub fn fold_statuses<I>(statuses: I) -> Option<Status>
where
    I: IntoIterator<Item = Status>,
{
    let mut iter = statuses.into_iter();
    let mut agg = iter.next()?;
    agg.avg_msg_per_sec = rate(agg.total_processed, agg.elapsed_seconds);

    for s in iter {
        agg.job_id = s.job_id;
        agg.node_id = s.node_id;
        agg.message = s.message;
        agg.status = s.status;
        agg.total_processed += s.total_processed;
        agg.total_errors += s.total_errors;
        agg.errors.extend(s.errors);

        if s.elapsed_seconds > agg.elapsed_seconds {
            agg.elapsed_seconds = s.elapsed_seconds;
        }

        agg.started_at = match (agg.started_at, s.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        agg.ended_at = match (agg.ended_at, s.ended_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let avg = rate(s.total_processed, agg.elapsed_seconds);
        agg.avg_msg_per_sec = (agg.avg_msg_per_sec + avg) / 2.0;
    }
    Some(agg)
}

fn rate(
    processed: u64,
    elapsed_seconds: f64,
) -> f64 {
    if elapsed_seconds > 0.0 {
        processed as f64 / elapsed_seconds
    } else {
        0.0
    }
}
