//! The run/resume orchestrator: builds every component, seeds the
//! frontier, drives the engine through its hops, then the resolver, and
//! leaves the database in a clean, resumable state whatever happens.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::api::{FamilySearchApi, TreeApi};
use crate::cli::RunArgs;
use crate::config::{CrawlConfig, ThrottleConfig};
use crate::control::{spawn_pause_file_poller, spawn_signal_handlers, CrawlControl};
use crate::engine::IterationEngine;
use crate::error::{CrawlError, Result};
use crate::metrics::MetricsEmitter;
use crate::model::{is_valid_seed, ResolutionPolicy, RunStatus};
use crate::resolver::RelationshipResolver;
use crate::session::ApiSession;
use crate::store::Store;
use crate::throttle::Throttle;

fn config_from_args(args: &RunArgs) -> CrawlConfig {
    CrawlConfig {
        max_hopcount: args.hopcount,
        persons_per_request: args.person_batch_size,
        inter_batch_delay_seconds: args.delay_between_batches,
        request_timeout_seconds: args.timeout,
        throttle: ThrottleConfig {
            requests_per_second: args.requests_per_second,
            max_concurrent_person_requests: args.max_concurrent_person_requests,
            max_concurrent_relationship_requests: args.max_concurrent_relationship_requests,
            max_retries: args.max_retries,
            backoff_base_seconds: args.backoff_base_seconds,
            backoff_multiplier: args.backoff_multiplier,
            backoff_max_seconds: args.backoff_max_seconds,
        },
        ..CrawlConfig::default()
    }
}

/// Run or resume a crawl to completion (or to a clean stop). The exit code
/// policy lives in `main`; this returns the taxonomy error on fatal paths.
pub async fn run_crawl(args: &RunArgs, resume: bool) -> Result<()> {
    let config = config_from_args(args);
    let control = Arc::new(CrawlControl::new());
    spawn_signal_handlers(Arc::clone(&control));
    if let Some(pause_file) = &args.pause_file {
        spawn_pause_file_poller(Arc::clone(&control), pause_file.into());
    }

    let store = Store::open(&args.common.outdir, &args.common.basename, !resume).await?;
    let metrics = Arc::new(MetricsEmitter::from_path(args.metrics_file.as_deref())?);

    if !resume {
        let seeds = args.individuals.clone();
        for seed in &seeds {
            if !is_valid_seed(seed) {
                return Err(CrawlError::Config(format!(
                    "invalid FamilySearch id: {seed}"
                )));
            }
        }
        if !seeds.is_empty() {
            store.record_seeds(&seeds).await?;
            let inserted = store.seed_frontier_if_empty(seeds).await?;
            if inserted > 0 {
                tracing::info!(inserted, "seeded frontier");
            }
        }
    }

    let status = store.get_status().await?;
    if status.frontier_depth == 0 && status.processing_depth == 0 && status.vertex_count == 0 {
        return Err(CrawlError::Config(
            "nothing to crawl: provide at least one seed id".to_string(),
        ));
    }

    store.set_max_hopcount(config.max_hopcount).await?;
    store.save_throttle_config(&config.throttle).await?;
    store.set_run_status(RunStatus::Running).await?;

    let session = ApiSession::new(
        &args.base_url,
        &args.session_token,
        concat!("fscrawl/", env!("CARGO_PKG_VERSION")),
        config.request_timeout_seconds,
    )?;
    let api: Arc<dyn TreeApi> = Arc::new(FamilySearchApi::new(session));
    let throttle = Arc::new(Throttle::new(config.throttle.clone(), Arc::clone(&control)));

    let start = Instant::now();
    metrics.emit(
        "run_start",
        json!({
            "resume": resume,
            "hopcount": config.max_hopcount,
            "frontier": status.frontier_depth,
            "vertices": status.vertex_count,
            "starting_iteration": status.starting_iteration,
        }),
    );

    let checkpoint_task = spawn_checkpoint_scheduler(
        store.clone(),
        Arc::clone(&control),
        Arc::clone(&metrics),
        config.checkpoint_interval_seconds,
    );

    let result = drive(
        &store,
        Arc::clone(&api),
        throttle,
        Arc::clone(&control),
        Arc::clone(&metrics),
        &config,
    )
    .await;

    checkpoint_task.abort();

    match result {
        Ok(stopped) => {
            let final_status = store.get_status().await?;
            store
                .set_run_status(if stopped {
                    RunStatus::Aborted
                } else {
                    RunStatus::Done
                })
                .await?;
            store.record_checkpoint("post-run").await?;
            metrics.emit(
                "run_complete",
                json!({
                    "stopped": stopped,
                    "duration_s": start.elapsed().as_secs_f64(),
                    "vertices": final_status.vertex_count,
                    "edges": final_status.edge_count,
                    "frontier": final_status.frontier_depth,
                    "http_requests": api.request_count(),
                }),
            );
            tracing::info!(
                vertices = final_status.vertex_count,
                edges = final_status.edge_count,
                frontier = final_status.frontier_depth,
                http_requests = api.request_count(),
                stopped,
                "run finished"
            );
            store.check_integrity().await?;
            Ok(())
        }
        Err(e) => {
            // Best effort: leave a coherent resume point behind even on a
            // fatal error.
            let _ = store.record_checkpoint("abort").await;
            let _ = store.set_run_status(RunStatus::Aborted).await;
            metrics.emit(
                "run_complete",
                json!({
                    "error": e.to_string(),
                    "duration_s": start.elapsed().as_secs_f64(),
                    "http_requests": api.request_count(),
                }),
            );
            Err(e)
        }
    }
}

/// Hops, then resolution. Returns whether the run was stopped early.
async fn drive(
    store: &Store,
    api: Arc<dyn TreeApi>,
    throttle: Arc<Throttle>,
    control: Arc<CrawlControl>,
    metrics: Arc<MetricsEmitter>,
    config: &CrawlConfig,
) -> Result<bool> {
    let engine = IterationEngine::new(
        Arc::clone(&api),
        store.clone(),
        Arc::clone(&throttle),
        Arc::clone(&control),
        Arc::clone(&metrics),
        config.clone(),
    );
    let outcome = engine.run_hops().await?;
    if outcome.stopped {
        return Ok(true);
    }

    // A hopcount at or below the completed iterations (possible on
    // resume) means no further expansion; resolution still runs.
    store.set_run_status(RunStatus::Resolving).await?;
    let last_iteration = store.next_iteration_to_run().await?.saturating_sub(1);
    let resolver = RelationshipResolver::new(
        api,
        store.clone(),
        throttle,
        Arc::clone(&control),
        ResolutionPolicy::default(),
        config.throttle.max_retries,
    );
    match resolver.run(last_iteration).await {
        Ok(report) => {
            metrics.emit(
                "relationships_complete",
                json!({
                    "relationships": report.relationships_fetched,
                    "edges_updated": report.edges_updated,
                    "skipped": report.skipped,
                    "duration_s": report.duration_s,
                }),
            );
            Ok(false)
        }
        Err(CrawlError::Cancelled) => {
            store.record_checkpoint("stop").await?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Forced checkpoint cadence while hops sit idle, on top of the commit at
/// every iteration close.
fn spawn_checkpoint_scheduler(
    store: Store,
    control: Arc<CrawlControl>,
    metrics: Arc<MetricsEmitter>,
    interval_seconds: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if interval_seconds == 0 {
            return;
        }
        loop {
            tokio::select! {
                _ = control.stop_token().cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval_seconds)) => {}
            }
            if control.is_paused() {
                continue; // the pause path writes its own checkpoint
            }
            if let Err(e) = store.record_checkpoint("scheduled").await {
                tracing::warn!(error = %e, "scheduled checkpoint failed");
                break;
            }
            metrics.emit("checkpoint", json!({"phase": "scheduled"}));
        }
    })
}
