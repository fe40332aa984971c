//! ControllerClient trait for mocking
//!
//! The node agent and the LUKS passphrase manager depend on this trait
//! rather than on [`crate::ControllerClient`] so unit tests can swap in
//! [`crate::MockControllerClient`].

use crate::error::ClientError;
use storage_core::api::{AddNodeResponse, VolumePublicationUpdate};
use storage_core::{ChapCredentials, Node};

/// Trait for controller REST API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ControllerClientTrait: Send + Sync {
    async fn create_node(&self, node: &Node) -> Result<AddNodeResponse, ClientError>;
    async fn list_nodes(&self) -> Result<Vec<String>, ClientError>;
    async fn delete_node(&self, name: &str) -> Result<(), ClientError>;
    async fn get_chap(&self, volume: &str, node: &str) -> Result<ChapCredentials, ClientError>;
    async fn update_volume_publication(
        &self,
        volume: &str,
        node: &str,
        update: &VolumePublicationUpdate,
    ) -> Result<(), ClientError>;
    async fn update_volume_luks_passphrase_names(&self, volume: &str, names: &[String]) -> Result<(), ClientError>;
}
