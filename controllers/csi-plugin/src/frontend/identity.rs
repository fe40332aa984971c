//! CSI Identity service.

use csi_proto::v1;
use csi_proto::v1::identity_server::Identity;
use csi_proto::v1::plugin_capability::{self, service, volume_expansion};
use storage_core::ORCHESTRATOR_VERSION;
use tonic::{Request, Response, Status};

use super::interceptor::unary;
use super::{CsiDriver, DRIVER_NAME};
use crate::error::PluginError;

fn capability(kind: plugin_capability::Type) -> v1::PluginCapability {
    v1::PluginCapability { r#type: Some(kind) }
}

impl CsiDriver {
    fn plugin_capabilities(&self) -> Vec<v1::PluginCapability> {
        let mut capabilities = Vec::new();
        if self.role().runs_controller() {
            capabilities.push(capability(plugin_capability::Type::Service(plugin_capability::Service {
                r#type: service::Type::ControllerService as i32,
            })));
            capabilities.push(capability(plugin_capability::Type::Service(plugin_capability::Service {
                r#type: service::Type::VolumeAccessibilityConstraints as i32,
            })));
        }
        capabilities.push(capability(plugin_capability::Type::VolumeExpansion(
            plugin_capability::VolumeExpansion {
                r#type: volume_expansion::Type::Online as i32,
            },
        )));
        capabilities
    }

    fn readiness_probe(&self) -> Result<v1::ProbeResponse, Status> {
        if let Some(parts) = &self.inner.controller {
            parts
                .orchestrator
                .is_ready()
                .map_err(|e| Status::from(PluginError::from(e)))?;
        }
        Ok(v1::ProbeResponse {
            ready: Some(self.readiness().is_ready()),
        })
    }
}

#[tonic::async_trait]
impl Identity for CsiDriver {
    async fn get_plugin_info(
        &self,
        request: Request<v1::GetPluginInfoRequest>,
    ) -> Result<Response<v1::GetPluginInfoResponse>, Status> {
        unary("GetPluginInfo", request, |_| async {
            Ok(v1::GetPluginInfoResponse {
                name: DRIVER_NAME.to_string(),
                vendor_version: ORCHESTRATOR_VERSION.to_string(),
                manifest: Default::default(),
            })
        })
        .await
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<v1::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<v1::GetPluginCapabilitiesResponse>, Status> {
        unary("GetPluginCapabilities", request, |_| async {
            Ok(v1::GetPluginCapabilitiesResponse {
                capabilities: self.plugin_capabilities(),
            })
        })
        .await
    }

    async fn probe(&self, request: Request<v1::ProbeRequest>) -> Result<Response<v1::ProbeResponse>, Status> {
        unary("Probe", request, |_| async { self.readiness_probe() }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::frontend::test_support;
    use crate::test_utils::FakeHostAgent;
    use controller_client::MockControllerClient;
    use std::sync::Arc;
    use storage_core::{BuiltinDriverFactory, CatalogOrchestrator, FakeDriver, InMemoryStore};

    #[tokio::test]
    async fn test_plugin_info() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        let info = driver
            .get_plugin_info(Request::new(v1::GetPluginInfoRequest {}))
            .await
            .expect("info")
            .into_inner();
        assert_eq!(info.name, "csi.trident.netapp.io");
        assert_eq!(info.vendor_version, ORCHESTRATOR_VERSION);
    }

    #[tokio::test]
    async fn test_node_role_does_not_announce_the_controller_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = test_support::node_driver(
            Arc::new(FakeHostAgent::new()),
            Arc::new(MockControllerClient::new()),
            dir.path(),
        );
        let capabilities = driver
            .get_plugin_capabilities(Request::new(v1::GetPluginCapabilitiesRequest {}))
            .await
            .expect("capabilities")
            .into_inner()
            .capabilities;
        assert_eq!(capabilities.len(), 1);
        assert!(matches!(
            capabilities[0].r#type,
            Some(plugin_capability::Type::VolumeExpansion(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_before_bootstrap_is_unavailable() {
        let catalog = Arc::new(CatalogOrchestrator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(BuiltinDriverFactory::new(Arc::new(FakeDriver::new()))),
        ));
        let driver = test_support::controller_driver(catalog);
        let status = driver
            .probe(Request::new(v1::ProbeRequest {}))
            .await
            .expect_err("not bootstrapped");
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_node_probe_follows_registration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = CsiDriver::builder(Role::Node, "n1")
            .node(
                Arc::new(MockControllerClient::new()),
                Arc::new(FakeHostAgent::new()),
                crate::node::TrackingStore::new(dir.path()),
            )
            .build()
            .expect("driver");

        let probe = |driver: CsiDriver| async move {
            driver
                .probe(Request::new(v1::ProbeRequest {}))
                .await
                .expect("probe")
                .into_inner()
                .ready
        };
        assert_eq!(probe(driver.clone()).await, Some(false));
        driver.register().await.expect("register");
        assert_eq!(probe(driver).await, Some(true));
    }
}
