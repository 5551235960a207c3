//! The hop-by-hop BFS driver.
//!
//! ```text
//!  IDLE ──start──▶ ITERATING ──hop done──▶ ITERATING ──hop budget──▶ RESOLVING
//!                     │                                                (runner)
//!                     ├── pause ──▶ checkpoint, park, resume
//!                     └── stop  ──▶ checkpoint, return
//! ```
//!
//! Each hop promotes the frontier into the processing set, fans the set out
//! as batched fetches, persists whatever comes back, returns failures to
//! the frontier, and closes the iteration with a committed log row. The
//! resume cursor only advances at that commit, so a crash at any point
//! replays the interrupted hop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::api::TreeApi;
use crate::batch::{chunk_pids, Dispatcher};
use crate::config::CrawlConfig;
use crate::control::CrawlControl;
use crate::error::{CrawlError, Result};
use crate::metrics::MetricsEmitter;
use crate::model::RunStatus;
use crate::persons::PersonProcessor;
use crate::store::Store;
use crate::throttle::Throttle;

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineOutcome {
    pub hops_completed: u32,
    /// True when the run was stopped cooperatively before the hop budget.
    pub stopped: bool,
}

pub struct IterationEngine {
    api: Arc<dyn TreeApi>,
    store: Store,
    throttle: Arc<Throttle>,
    control: Arc<CrawlControl>,
    metrics: Arc<MetricsEmitter>,
    config: CrawlConfig,
}

impl IterationEngine {
    pub fn new(
        api: Arc<dyn TreeApi>,
        store: Store,
        throttle: Arc<Throttle>,
        control: Arc<CrawlControl>,
        metrics: Arc<MetricsEmitter>,
        config: CrawlConfig,
    ) -> Self {
        Self {
            api,
            store,
            throttle,
            control,
            metrics,
            config,
        }
    }

    /// Run hops until the budget is reached, the frontier drains, or a
    /// stop is requested. Returns how far the run got; the caller decides
    /// whether to move on to relationship resolution.
    pub async fn run_hops(&self) -> Result<EngineOutcome> {
        let mut outcome = EngineOutcome::default();

        loop {
            if self.control.is_paused() && !self.pause_gate().await? {
                outcome.stopped = true;
                return Ok(outcome);
            }
            if self.control.check().is_err() {
                self.stop_checkpoint(None).await?;
                outcome.stopped = true;
                return Ok(outcome);
            }

            let n = self.store.next_iteration_to_run().await?;
            if n >= self.config.max_hopcount {
                tracing::info!(completed = n, "hop budget reached");
                return Ok(outcome);
            }

            let processing = self
                .store
                .start_iteration(n, self.config.drain_limit)
                .await?;
            if processing.is_empty() {
                tracing::info!(iteration = n, "frontier exhausted");
                return Ok(outcome);
            }
            tracing::info!(iteration = n, pids = processing.len(), "hop started");
            let start = Instant::now();

            let processor = Arc::new(PersonProcessor::new(
                self.store.clone(),
                self.config.payload_checkpoint_every,
            ));
            let dispatcher = Dispatcher {
                api: Arc::clone(&self.api),
                store: self.store.clone(),
                throttle: Arc::clone(&self.throttle),
                control: Arc::clone(&self.control),
                processor,
                inter_batch_delay: Duration::from_secs_f64(
                    self.config.inter_batch_delay_seconds.max(0.0),
                ),
                max_retries: self.config.throttle.max_retries,
                shutdown_grace: Duration::from_secs(self.config.shutdown_grace_seconds),
            };
            let batches = chunk_pids(&processing, self.config.persons_per_request);

            match dispatcher.run(batches, n).await {
                Ok(report) => {
                    self.metrics.emit(
                        "person_batch",
                        json!({
                            "iteration": n,
                            "batches": report.batches_dispatched,
                            "batches_failed": report.batches_failed,
                            "persons": report.persons_processed,
                            "edges": report.edges_processed,
                            "pids_returned": report.pids_returned,
                            "http_requests": self.api.request_count(),
                        }),
                    );
                }
                Err(CrawlError::Cancelled) => {
                    self.stop_checkpoint(Some(n)).await?;
                    outcome.stopped = true;
                    return Ok(outcome);
                }
                Err(fatal) => return Err(fatal),
            }

            // Requested-but-unreturned pids are still in processing; the
            // close drains them back to the frontier before committing.
            let record = self
                .store
                .end_iteration(n, start.elapsed().as_secs_f64())
                .await?;
            outcome.hops_completed += 1;
            tracing::info!(
                iteration = n,
                vertices = record.vertices,
                frontier = record.frontier,
                edges = record.edges,
                duration_s = record.duration_s,
                "hop complete"
            );
            self.metrics.emit(
                "iteration_complete",
                json!({
                    "iteration": n,
                    "duration_s": record.duration_s,
                    "vertices": record.vertices,
                    "frontier": record.frontier,
                    "edges": record.edges,
                    "spanning_edges": record.spanning_edges,
                    "frontier_edges": record.frontier_edges,
                    "http_requests": self.api.request_count(),
                }),
            );
        }
    }

    /// Commit a pause checkpoint and park until resume. Returns `false`
    /// when the pause ended in a stop request.
    async fn pause_gate(&self) -> Result<bool> {
        self.store.record_checkpoint("pause").await?;
        self.store.set_run_status(RunStatus::Paused).await?;
        self.control.mark_pause_checkpointed();
        self.metrics.emit("checkpoint", json!({"phase": "pause"}));
        tracing::info!("paused at hop boundary");

        match self.control.wait_if_paused().await {
            Ok(()) => {
                self.store.set_run_status(RunStatus::Running).await?;
                tracing::info!("resumed");
                Ok(true)
            }
            Err(CrawlError::Cancelled) => {
                self.stop_checkpoint(None).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Quiesce for a stop: return any in-processing pids to the frontier
    /// so no fetched-but-unprocessed work is lost, then checkpoint.
    async fn stop_checkpoint(&self, iteration: Option<u32>) -> Result<()> {
        let remaining = self.store.get_ids_to_process().await?;
        if !remaining.is_empty() {
            let released = self.store.release_to_frontier(remaining).await?;
            tracing::info!(released, "returned in-flight pids to frontier on stop");
        }
        self.store.record_checkpoint("stop").await?;
        self.metrics.emit(
            "checkpoint",
            json!({"phase": "stop", "iteration": iteration}),
        );
        Ok(())
    }
}
