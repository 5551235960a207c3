//! Splits a processing set into `persons` request batches and drives their
//! bounded-parallel dispatch under the person-phase throttle, including the
//! pause/stop quiesce points between dispatches.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::api::TreeApi;
use crate::control::CrawlControl;
use crate::error::{CrawlError, Result};
use crate::model::{PersonsPayload, Pid, RunStatus};
use crate::persons::PersonProcessor;
use crate::store::Store;
use crate::throttle::{Phase, Throttle};

/// Chunk pids into groups of at most `size`, preserving order.
pub fn chunk_pids(pids: &[Pid], size: usize) -> Vec<Vec<Pid>> {
    let size = size.max(1);
    pids.chunks(size).map(|c| c.to_vec()).collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchReport {
    pub batches_dispatched: usize,
    pub batches_failed: usize,
    pub persons_processed: usize,
    pub edges_processed: usize,
    pub pids_returned: usize,
}

enum BatchOutcome {
    Processed { persons: usize, edges: usize },
    /// Permanently failed; pids were released back to the frontier.
    Failed { released: usize },
}

/// Everything a dispatch run needs besides the batches themselves.
pub struct Dispatcher {
    pub api: Arc<dyn TreeApi>,
    pub store: Store,
    pub throttle: Arc<Throttle>,
    pub control: Arc<CrawlControl>,
    pub processor: Arc<PersonProcessor>,
    pub inter_batch_delay: Duration,
    pub max_retries: u32,
    pub shutdown_grace: Duration,
}

impl Dispatcher {
    /// Dispatch every batch concurrently (the person-phase semaphore
    /// bounds actual parallelism) and hand each payload to the processor.
    ///
    /// Between dispatches this is the engine's quiesce point: a pause
    /// drains in-flight batches, commits a checkpoint, and parks; a stop
    /// drains within the shutdown grace period and returns `Cancelled`.
    pub async fn run(&self, batches: Vec<Vec<Pid>>, iteration: u32) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut in_flight: JoinSet<Result<BatchOutcome>> = JoinSet::new();
        let mut first_fatal: Option<CrawlError> = None;

        for batch in batches {
            if self.control.is_paused() {
                drain(&mut in_flight, &mut report, &mut first_fatal).await;
                if let Some(e) = first_fatal.take() {
                    return Err(e);
                }
                self.store.record_checkpoint("pause").await?;
                self.store.set_run_status(RunStatus::Paused).await?;
                self.control.mark_pause_checkpointed();
                tracing::info!(iteration, "paused mid-hop after checkpoint");
                self.control.wait_if_paused().await?;
                self.store.set_run_status(RunStatus::Running).await?;
            }
            if self.control.check().is_err() {
                break;
            }

            let task_api = Arc::clone(&self.api);
            let task_store = self.store.clone();
            let task_throttle = Arc::clone(&self.throttle);
            let task_processor = Arc::clone(&self.processor);
            let max_retries = self.max_retries;
            in_flight.spawn(async move {
                run_batch(
                    task_api,
                    task_store,
                    task_throttle,
                    task_processor,
                    batch,
                    iteration,
                    max_retries,
                )
                .await
            });
            report.batches_dispatched += 1;

            // Legacy politeness floor between dispatches, on top of the
            // token bucket.
            if self.inter_batch_delay > Duration::ZERO {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
        }

        if self.control.is_stopping() {
            // In-flight fetches may complete (their results persist), but
            // only within the grace period.
            let drained = tokio::time::timeout(
                self.shutdown_grace,
                drain(&mut in_flight, &mut report, &mut first_fatal),
            )
            .await;
            if drained.is_err() {
                tracing::warn!("shutdown grace expired; abandoning in-flight batches");
                in_flight.abort_all();
                while in_flight.join_next().await.is_some() {}
            }
            return match first_fatal {
                Some(e) => Err(e),
                None => Err(CrawlError::Cancelled),
            };
        }

        drain(&mut in_flight, &mut report, &mut first_fatal).await;
        match first_fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Join all in-flight batches, tallying outcomes. Cancelled tasks are
/// benign (their pids stay in processing for the leftover sweep); the
/// first fatal error is kept for the caller while the rest still drain.
async fn drain(
    in_flight: &mut JoinSet<Result<BatchOutcome>>,
    report: &mut BatchReport,
    first_fatal: &mut Option<CrawlError>,
) {
    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok(Ok(BatchOutcome::Processed { persons, edges })) => {
                report.persons_processed += persons;
                report.edges_processed += edges;
            }
            Ok(Ok(BatchOutcome::Failed { released })) => {
                report.batches_failed += 1;
                report.pids_returned += released;
            }
            Ok(Err(CrawlError::Cancelled)) => {}
            Ok(Err(e)) => {
                if first_fatal.is_none() {
                    *first_fatal = Some(e);
                }
            }
            Err(join_err) => {
                if first_fatal.is_none() {
                    *first_fatal =
                        Some(CrawlError::Transient(format!("batch task failed: {join_err}")));
                }
            }
        }
    }
}

async fn run_batch(
    api: Arc<dyn TreeApi>,
    store: Store,
    throttle: Arc<Throttle>,
    processor: Arc<PersonProcessor>,
    batch: Vec<Pid>,
    iteration: u32,
    max_retries: u32,
) -> Result<BatchOutcome> {
    match fetch_with_retry(&*api, &throttle, &batch, max_retries).await {
        Ok(payload) => {
            let stats = processor.process(payload, iteration).await?;
            Ok(BatchOutcome::Processed {
                persons: stats.persons,
                edges: stats.edges,
            })
        }
        Err(
            e @ (CrawlError::Throttled { .. }
            | CrawlError::Transient(_)
            | CrawlError::PermanentFailure(_)
            | CrawlError::CorruptPayload(_)),
        ) => {
            // Retries exhausted or outright permanent: this batch is done
            // for the hop, but its pids go back to the frontier rather
            // than being lost.
            tracing::warn!(
                error = %e,
                pids = batch.len(),
                "person batch failed permanently; returning pids to frontier"
            );
            let released = store.release_to_frontier(batch).await?;
            Ok(BatchOutcome::Failed { released })
        }
        Err(fatal) => Err(fatal),
    }
}

/// One batch fetch with the taxonomy-driven retry loop. Throttled and
/// transient failures are reported to the rate controller (which slows the
/// whole run) and retried up to `max_retries`; everything else surfaces.
async fn fetch_with_retry(
    api: &dyn TreeApi,
    throttle: &Throttle,
    batch: &[Pid],
    max_retries: u32,
) -> Result<PersonsPayload> {
    let mut attempt = 0;
    loop {
        let permit = throttle.acquire(Phase::Person).await?;
        let result = api.fetch_persons(batch).await;
        drop(permit);

        match result {
            Ok(payload) => {
                throttle.report_success();
                return Ok(payload);
            }
            Err(e @ (CrawlError::Throttled { .. } | CrawlError::Transient(_))) => {
                let retry_after = match &e {
                    CrawlError::Throttled {
                        retry_after: Some(secs),
                        ..
                    } => Some(Duration::from_secs(*secs)),
                    _ => None,
                };
                throttle.report_failure(retry_after);
                attempt += 1;
                if attempt > max_retries {
                    tracing::warn!(error = %e, attempt, "retries exhausted for person batch");
                    return Err(e);
                }
                tracing::debug!(error = %e, attempt, "retrying person batch");
            }
            Err(other) => return Err(other),
        }
    }
}
