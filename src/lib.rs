pub mod api;
pub mod backoff;
pub mod batch;
pub mod cli;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod orchestration;
pub mod persons;
pub mod resolver;
pub mod session;
pub mod store;
pub mod throttle;

// Re-export main types for library usage
pub use api::{FamilySearchApi, TreeApi};
pub use config::{CrawlConfig, ThrottleConfig};
pub use control::CrawlControl;
pub use engine::{EngineOutcome, IterationEngine};
pub use error::{CrawlError, Result};
pub use metrics::MetricsEmitter;
pub use model::{Edge, Gender, Pid, RelationshipType, RunStatus, Vertex};
pub use resolver::RelationshipResolver;
pub use store::{Store, StoreStatus};
pub use throttle::{Phase, Throttle};
