//! Advisor Backends: clients for the services behind the gateway
//!
//! - `aggregator`: hits, acknowledgements and disables (system of record)
//! - `content_service`: static rule content feeding the `ContentDirectory`
//! - `inventory`: active clusters of an organization
//! - `ams`: account management service, source of cluster names and managed status

pub mod acks;
pub mod aggregator;
pub mod ams;
pub mod content_service;
pub mod disabled;
pub mod inventory;
pub mod memory;

pub use acks::{AckOutcome, AckStore};
pub use aggregator::{AggregatorApi, HttpAggregator};
pub use ams::AmsInventory;
pub use content_service::{refresh_once, spawn_refresh_loop, ContentServiceClient, ContentSource};
pub use disabled::{build_disabled_cluster_index, load_overrides};
pub use inventory::{AggregatorInventory, ClusterInventory, FallbackInventory, StaticInventory};
pub use memory::{AggregatorCall, InMemoryAggregator};
