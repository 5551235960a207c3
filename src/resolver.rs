//! Post-crawl relationship resolution: edges flagged `Resolve` get their
//! authoritative type fetched and rewritten.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use crate::api::TreeApi;
use crate::control::CrawlControl;
use crate::error::{CrawlError, Result};
use crate::model::{RelationshipType, ResolutionPolicy};
use crate::store::Store;
use crate::throttle::{Phase, Throttle};

#[derive(Debug, Default, Clone, Copy)]
pub struct ResolutionReport {
    /// Edges rewritten to an authoritative type.
    pub edges_updated: usize,
    /// Relationship ids fetched.
    pub relationships_fetched: usize,
    /// Ids that failed permanently and stay flagged `Resolve`.
    pub skipped: usize,
    pub duration_s: f64,
}

pub struct RelationshipResolver {
    api: Arc<dyn TreeApi>,
    store: Store,
    throttle: Arc<Throttle>,
    control: Arc<CrawlControl>,
    policy: ResolutionPolicy,
    max_retries: u32,
}

impl RelationshipResolver {
    pub fn new(
        api: Arc<dyn TreeApi>,
        store: Store,
        throttle: Arc<Throttle>,
        control: Arc<CrawlControl>,
        policy: ResolutionPolicy,
        max_retries: u32,
    ) -> Self {
        Self {
            api,
            store,
            throttle,
            control,
            policy,
            max_retries,
        }
    }

    /// Flag, fetch, and rewrite until a pass produces nothing new.
    /// Permanently failed ids are skipped (and stay `Resolve` in the
    /// store) rather than looping forever.
    pub async fn run(&self, last_iteration: u32) -> Result<ResolutionReport> {
        let start = Instant::now();
        let mut report = ResolutionReport::default();
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            self.control.check()?;
            self.store.determine_resolution(last_iteration).await?;

            let todo: Vec<String> = self
                .store
                .relationships_to_resolve()
                .await?
                .into_iter()
                .filter(|id| !attempted.contains(id))
                .collect();
            if todo.is_empty() {
                break;
            }
            tracing::info!(count = todo.len(), "resolving relationship types");

            let mut in_flight: JoinSet<Result<(String, Option<Vec<RelationshipType>>)>> =
                JoinSet::new();
            for rel_id in todo {
                attempted.insert(rel_id.clone());
                let api = Arc::clone(&self.api);
                let throttle = Arc::clone(&self.throttle);
                let max_retries = self.max_retries;
                in_flight.spawn(async move {
                    let facts = fetch_with_retry(&*api, &throttle, &rel_id, max_retries).await?;
                    Ok((rel_id, facts))
                });
            }

            while let Some(joined) = in_flight.join_next().await {
                let (rel_id, facts) = joined
                    .map_err(|e| CrawlError::Transient(format!("resolver task failed: {e}")))??;
                match facts {
                    Some(types) => {
                        let authoritative = self.policy.authoritative(&types);
                        let updated = self
                            .store
                            .update_relationship(rel_id, authoritative)
                            .await?;
                        report.relationships_fetched += 1;
                        report.edges_updated += updated;
                    }
                    None => {
                        tracing::warn!(rel_id, "relationship fetch failed permanently; leaving flagged");
                        report.skipped += 1;
                    }
                }
            }
        }

        report.duration_s = start.elapsed().as_secs_f64();
        self.store
            .end_relationship_resolution(report.duration_s, report.edges_updated)
            .await?;
        Ok(report)
    }
}

/// Fetch one relationship with the shared retry loop. `Ok(None)` means the
/// id failed permanently (or retries ran out) and should be skipped.
async fn fetch_with_retry(
    api: &dyn TreeApi,
    throttle: &Throttle,
    rel_id: &str,
    max_retries: u32,
) -> Result<Option<Vec<RelationshipType>>> {
    let mut attempt = 0;
    loop {
        let permit = throttle.acquire(Phase::Relationship).await?;
        let result = api.fetch_relationship(rel_id).await;
        drop(permit);

        match result {
            Ok(types) => {
                throttle.report_success();
                return Ok(Some(types));
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
                    tracing::warn!(rel_id, error = %e, "retries exhausted for relationship");
                    return Ok(None);
                }
            }
            Err(CrawlError::PermanentFailure(status)) => {
                tracing::warn!(rel_id, status, "permanent failure fetching relationship");
                return Ok(None);
            }
            Err(CrawlError::CorruptPayload(msg)) => {
                tracing::warn!(rel_id, msg, "corrupt relationship payload");
                return Ok(None);
            }
            Err(fatal) => return Err(fatal),
        }
    }
}
