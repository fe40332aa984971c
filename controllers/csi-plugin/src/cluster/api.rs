//! Cluster calls made outside the watchers.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use semver::Version;
use storage_core::{OrchestratorError, Result};

/// Direct reads and writes against the API server
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// API server version, without any vendor suffix
    async fn server_version(&self) -> Result<Version>;

    /// Names of every node in the cluster
    async fn list_node_names(&self) -> Result<BTreeSet<String>>;

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;
}

/// Maps a kube error onto the orchestrator categories
fn categorize(kind: &'static str, name: &str, error: kube::Error) -> OrchestratorError {
    match error {
        kube::Error::Api(e) if e.code == 404 => OrchestratorError::not_found(kind, name),
        kube::Error::Api(e) if e.code == 409 => OrchestratorError::already_exists(kind, name),
        kube::Error::Api(e) if e.code == 400 || e.code == 422 => {
            OrchestratorError::invalid(format!("{kind} {name}: {}", e.message))
        }
        other => OrchestratorError::Connection(format!("{kind} {name}: {other}")),
    }
}

/// Parse a `gitVersion` such as `v1.30.2-eks-1234`.
///
/// Only major, minor and patch are kept so vendor builds compare equal to
/// the release they are based on.
pub fn parse_server_version(git_version: &str) -> Result<Version> {
    let trimmed = git_version.trim().trim_start_matches('v');
    let parsed = Version::parse(trimmed)
        .map_err(|e| OrchestratorError::invalid(format!("server version '{git_version}': {e}")))?;
    Ok(Version::new(parsed.major, parsed.minor, parsed.patch))
}

/// [`ClusterApi`] over a kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi").finish_non_exhaustive()
    }
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn server_version(&self) -> Result<Version> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| categorize("version", "apiserver", e))?;
        parse_server_version(&info.git_version)
    }

    async fn list_node_names(&self) -> Result<BTreeSet<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| categorize("Node", "list", e))?;
        Ok(list.items.iter().map(ResourceExt::name_any).collect())
    }

    async fn get_pvc(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        claims
            .get_opt(name)
            .await
            .map_err(|e| categorize("PersistentVolumeClaim", &format!("{namespace}/{name}"), e))
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = pvc.namespace().unwrap_or_else(|| "default".to_string());
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        claims
            .create(&PostParams::default(), pvc)
            .await
            .map_err(|e| categorize("PersistentVolumeClaim", &format!("{namespace}/{}", pvc.name_any()), e))
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        volumes
            .get_opt(name)
            .await
            .map_err(|e| categorize("PersistentVolume", name, e))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_suffix_is_dropped() {
        assert_eq!(parse_server_version("v1.30.2-eks-1234").expect("parse"), Version::new(1, 30, 2));
        assert_eq!(parse_server_version("1.16.0").expect("parse"), Version::new(1, 16, 0));
        assert!(parse_server_version("v1.30.2-eks-1234").expect("parse") >= Version::new(1, 30, 2));
    }

    #[test]
    fn test_garbage_version_is_invalid() {
        let err = parse_server_version("banana").expect_err("garbage");
        assert!(err.to_string().contains("banana"));
    }
}
