//! Controller REST API
//!
//! HTTP surface of the orchestrator catalog, used by node plugins and
//! operators. Served over mutual TLS in production.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rest_api::{AppState, RateLimiter, RestServerConfig, router, serve};
//! use storage_core::{BuiltinDriverFactory, CatalogOrchestrator, FakeDriver, InMemoryStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = Arc::new(CatalogOrchestrator::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(BuiltinDriverFactory::default()),
//! ));
//! let app = router(AppState::new(catalog), Arc::new(RateLimiter::for_publications()));
//! let config = RestServerConfig { listen: "127.0.0.1:8000".parse()?, tls: None };
//! serve(app, config, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod error;
pub mod handlers;
pub mod probes;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod state;
pub mod tls;

pub use audit::REQUEST_ID_HEADER;
pub use error::{ApiError, ApiResult};
pub use probes::{Readiness, probe_router};
pub use rate_limit::RateLimiter;
pub use router::{API_BASE_PATH, router};
pub use server::{RestServerConfig, ServerError, serve};
pub use state::AppState;
pub use tls::{ServerTlsConfig, TlsError};
