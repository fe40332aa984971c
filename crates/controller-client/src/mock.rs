//! Mock ControllerClient for unit testing
//!
//! Keeps nodes and CHAP credentials in memory and records every mutating
//! call so tests can assert on exactly what the controller would have seen.

use crate::controller_trait::ControllerClientTrait;
use crate::error::ClientError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use storage_core::api::{AddNodeResponse, VolumePublicationUpdate};
use storage_core::{ChapCredentials, Node};

#[derive(Debug, Default)]
struct MockState {
    nodes: BTreeMap<String, Node>,
    chap: BTreeMap<(String, String), ChapCredentials>,
    luks_updates: Vec<(String, Vec<String>)>,
    publication_updates: Vec<(String, String, VolumePublicationUpdate)>,
    create_node_failures: usize,
    create_node_calls: usize,
}

/// Mock ControllerClient for testing
#[derive(Debug, Clone, Default)]
pub struct MockControllerClient {
    state: Arc<Mutex<MockState>>,
}

impl MockControllerClient {
    /// Create a new mock client
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A test that panicked while holding the lock has already failed.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next `n` `create_node` calls fail with a connection error
    pub fn fail_create_node(&self, n: usize) {
        self.state().create_node_failures = n;
    }

    /// Number of `create_node` calls, failed ones included
    pub fn create_node_calls(&self) -> usize {
        self.state().create_node_calls
    }

    /// Seed CHAP credentials (for test setup)
    pub fn add_chap(&self, volume: &str, node: &str, chap: ChapCredentials) {
        self.state().chap.insert((volume.to_string(), node.to_string()), chap);
    }

    /// Registered node, if any
    pub fn node(&self, name: &str) -> Option<Node> {
        self.state().nodes.get(name).cloned()
    }

    /// Every LUKS passphrase-name update, in call order
    pub fn luks_updates(&self) -> Vec<(String, Vec<String>)> {
        self.state().luks_updates.clone()
    }

    /// Every publication update, in call order
    pub fn publication_updates(&self) -> Vec<(String, String, VolumePublicationUpdate)> {
        self.state().publication_updates.clone()
    }
}

#[async_trait::async_trait]
impl ControllerClientTrait for MockControllerClient {
    async fn create_node(&self, node: &Node) -> Result<AddNodeResponse, ClientError> {
        let mut state = self.state();
        state.create_node_calls += 1;
        if state.create_node_failures > 0 {
            state.create_node_failures -= 1;
            return Err(ClientError::Connection("could not add node: connection refused".to_string()));
        }
        state.nodes.insert(node.name.clone(), node.clone());
        Ok(AddNodeResponse {
            name: node.name.clone(),
            topology_labels: node.topology_labels.clone(),
        })
    }

    async fn list_nodes(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.state().nodes.keys().cloned().collect())
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClientError> {
        self.state().nodes.remove(name);
        Ok(())
    }

    async fn get_chap(&self, volume: &str, node: &str) -> Result<ChapCredentials, ClientError> {
        self.state()
            .chap
            .get(&(volume.to_string(), node.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::Api {
                operation: "could not get CHAP info".to_string(),
                status: 404,
                message: format!("CHAP credentials {volume}.{node} was not found"),
            })
    }

    async fn update_volume_publication(
        &self,
        volume: &str,
        node: &str,
        update: &VolumePublicationUpdate,
    ) -> Result<(), ClientError> {
        self.state()
            .publication_updates
            .push((volume.to_string(), node.to_string(), update.clone()));
        Ok(())
    }

    async fn update_volume_luks_passphrase_names(&self, volume: &str, names: &[String]) -> Result<(), ClientError> {
        self.state().luks_updates.push((volume.to_string(), names.to_vec()));
        Ok(())
    }
}
