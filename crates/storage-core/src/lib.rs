//! Storage orchestrator core
//!
//! Domain model and catalog interfaces shared by the CSI plugin, the
//! controller REST API and the node-side REST client.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use storage_core::{BuiltinDriverFactory, CatalogOrchestrator, FakeDriver, InMemoryStore, Orchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = CatalogOrchestrator::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(BuiltinDriverFactory::new(Arc::new(FakeDriver::new()))),
//! );
//! catalog.bootstrap().await?;
//!
//! catalog.add_backend("fake1", "fake", serde_json::json!({"protocol": "block"})).await?;
//! let backends = catalog.list_backends().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - **model**: backends, pools, storage classes, volumes, snapshots, publications, nodes
//! - **orchestrator**: the [`Orchestrator`] trait every frontend drives
//! - **catalog**: [`CatalogOrchestrator`], the in-process implementation
//! - **interfaces**: backend driver and persistence seams
//! - **api**: controller REST wire types
//! - **frontend**: the container orchestrator helper surface

pub mod api;
pub mod attributes;
pub mod catalog;
pub mod context;
pub mod error;
pub mod fake;
pub mod frontend;
pub mod interfaces;
pub mod model;
pub mod orchestrator;
pub mod pools;
pub mod storage_class;
pub mod store;

pub use catalog::{CatalogOrchestrator, ORCHESTRATOR_VERSION};
pub use context::{RequestContext, RequestSource, current_context, current_request_id, with_request_context};
pub use error::{OrchestratorError, Result};
pub use fake::{BuiltinDriverFactory, FAKE_DRIVER_KIND, FakeDriver};
pub use frontend::{CsiAccessMode, Feature, FrontendHelper, VolumeRequest, reduce_access_modes};
pub use interfaces::{BackendDescription, BackendDriver, DriverFactory, PersistentStore, RecordKind};
pub use model::*;
pub use orchestrator::Orchestrator;
pub use pools::{PoolMap, encode_pool_map, parse_pool_map};
pub use storage_class::storage_class_config_from_parameters;
pub use store::InMemoryStore;
