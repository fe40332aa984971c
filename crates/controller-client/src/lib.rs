//! Storage controller REST client
//!
//! Used by node agents to register themselves, fetch CHAP credentials and
//! report publication and LUKS state back to the controller.
//!
//! # Example
//!
//! ```no_run
//! use controller_client::{ControllerClient, TlsConfig};
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let tls = TlsConfig {
//!     ca_cert_file: Some(PathBuf::from("/certs/ca.crt")),
//!     client_cert_file: Some(PathBuf::from("/certs/tls.crt")),
//!     client_key_file: Some(PathBuf::from("/certs/tls.key")),
//!     ..Default::default()
//! };
//! let client = ControllerClient::new("trident-csi", 34571, Some(&tls))?;
//! let nodes = client.list_nodes().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod controller_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod tls;

pub use client::{API_BASE_PATH, ControllerClient, REQUEST_ID_HEADER, REQUEST_TIMEOUT};
pub use controller_trait::ControllerClientTrait;
pub use error::ClientError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockControllerClient;
pub use tls::{DEFAULT_SERVER_NAME, TlsConfig};
