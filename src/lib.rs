//! # Graph Index Replicator
//!
//! Replicates committed graph changes (nodes, relationships, labels,
//! properties) into a document search index.
//!
//! ## Architecture
//!
//! The replicator sits between the host graph database and a search index,
//! turning each committed transaction into bulk index operations:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        graph-index-replicator                            │
//! │                                                                          │
//! │  ┌────────────┐   ┌─────────────────┐   ┌─────────────┐   ┌──────────┐   │
//! │  │ CommitFeed │──►│ ChangeExtractor │──►│  Mapping    │──►│ Document │   │
//! │  │ (per db)   │   │ (coalesce)      │   │  (resolve)  │   │ Builder  │   │
//! │  └────────────┘   └─────────────────┘   └─────────────┘   └──────────┘   │
//! │                                                                │         │
//! │                                                                ▼         │
//! │                    ┌───────────────────────────────────────────────┐     │
//! │                    │ Dispatch lanes (hash of index/type/id)        │     │
//! │                    │ SyncWriter: collapse, bulk, retry, circuit    │     │
//! │                    └───────────────────────────────────────────────┘     │
//! │                                                                │         │
//! └────────────────────────────────────────────────────────────────┼─────────┘
//!                                                                  ▼
//!                                                             SearchIndex
//! ```
//!
//! ## Mapping
//!
//! A JSON mapping document decides, per label set, which `(index, type)`
//! destinations an entity is written to and which properties are copied.
//! See [`mapping`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use graph_index_replicator::{
//!     CommitFeed, EntityDiff, EntityKind, EntitySnapshot, InMemoryIndex,
//!     ReplicationConfig, ReplicationEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let feed = Arc::new(CommitFeed::new());
//!     let index = Arc::new(InMemoryIndex::new());
//!
//!     let mut engine = ReplicationEngine::from_config(ReplicationConfig::default(), index, feed.clone())
//!         .expect("invalid configuration");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Host side, after each successful commit
//!     let person = EntitySnapshot::new(["Person"], [("uuid", "8c1f"), ("name", "Ada")]);
//!     feed.publish(vec![EntityDiff::created(EntityKind::Node, 1, person)]);
//!
//!     engine.stop().await;
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod extract;
pub mod graph;
pub mod index;
pub mod mapping;
pub mod metrics;
pub mod resilience;
pub mod writer;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, IndexCircuit};
pub use config::{
    CircuitBreakerConfig, DispatchConfig, ReplicationConfig, ReplicationSettings, RetryPassConfig,
    SloConfig, WriterConfig,
};
pub use coordinator::{EngineState, HealthCheck, ReplicationEngine, StatsSnapshot};
pub use document::{BuiltDocuments, DocKey, DocumentBuilder, IndexDocument};
pub use error::{ReplicationError, Result};
pub use extract::{ChangeExtractor, ChangeOperation, EntityChange};
pub use graph::{
    CommitFeed, CommitSource, CommitSubscription, EntityDiff, EntityKind, EntitySnapshot,
    PropertyValue, TransactionData,
};
pub use index::{BulkItemOutcome, InMemoryIndex, IndexError, SearchIndex};
pub use mapping::{JsonFileMapping, Mapping, MappingConfig, MappingRule, RelationshipPolicy};
pub use writer::{DispatchReport, SyncBatch, SyncWriter};
