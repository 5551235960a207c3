//! Applies a parsed `persons` payload to the store: vertices in, edges in,
//! newly discovered pids onto the frontier.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::model::{PersonsPayload, RelationshipType, Vertex};
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessStats {
    pub persons: usize,
    pub edges: usize,
}

pub struct PersonProcessor {
    store: Store,
    /// Mid-iteration commit checkpoint after this many payloads, so a
    /// crash mid-hop loses at most that much work.
    checkpoint_every: usize,
    payloads_processed: AtomicUsize,
}

impl PersonProcessor {
    pub fn new(store: Store, checkpoint_every: usize) -> Self {
        Self {
            store,
            checkpoint_every: checkpoint_every.max(1),
            payloads_processed: AtomicUsize::new(0),
        }
    }

    /// Persist one payload under iteration `n`. Every store write is
    /// idempotent, so re-processing a payload after crash recovery cannot
    /// duplicate state.
    pub async fn process(&self, payload: PersonsPayload, iteration: u32) -> Result<ProcessStats> {
        let mut stats = ProcessStats::default();

        for person in payload.persons {
            self.store
                .add_individual(Vertex {
                    pid: person.pid,
                    gender: person.gender,
                    surname: person.surname,
                    given_name: person.given_name,
                    iteration,
                    lifespan: person.lifespan,
                })
                .await?;
            stats.persons += 1;
        }

        for rel in payload.parent_child {
            let rel_type = rel
                .fact_type
                .unwrap_or(RelationshipType::UnspecifiedParentType);
            self.store
                .add_parent_child_relationship(rel.parent, rel.child, rel.rel_id, rel_type)
                .await?;
            stats.edges += 1;
        }

        if !payload.couple_members.is_empty() {
            self.store.add_to_frontier(payload.couple_members).await?;
        }

        let processed = self.payloads_processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % self.checkpoint_every == 0 {
            self.store.record_checkpoint("mid_iteration").await?;
        }

        Ok(stats)
    }
}
