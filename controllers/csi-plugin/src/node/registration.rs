//! Node registration with the controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use controller_client::ControllerClientTrait;
use storage_core::{Node, NodePublicationState};
use tracing::{info, warn};

use super::host::HostAgent;
use crate::backoff::{ExponentialBackoff, retry};

/// Gather the facts the controller needs about this node
pub async fn describe_node(
    host: &dyn HostAgent,
    name: &str,
    topology_labels: BTreeMap<String, String>,
) -> Node {
    let iqn = host.initiator_iqn().await.unwrap_or_else(|e| {
        warn!(error = %e, "No iSCSI initiator name, block volumes will not attach");
        String::new()
    });
    let ips = host.node_ips().await.unwrap_or_default();
    let host_info = host.host_info().await.ok();

    Node {
        name: name.to_string(),
        iqn,
        ips,
        topology_labels,
        host_info,
        publication_state: NodePublicationState::Ready,
    }
}

/// Register `node`, retrying until the controller accepts it.
///
/// Returns the topology labels the controller recorded.
pub async fn register_node(controller: Arc<dyn ControllerClientTrait>, node: Node) -> BTreeMap<String, String> {
    let backoff = ExponentialBackoff::new(
        std::time::Duration::from_secs(1),
        2.0,
        0.1,
        std::time::Duration::from_secs(60),
    );
    let outcome = retry(backoff, "register node", |_| true, || {
        let controller = Arc::clone(&controller);
        let node = node.clone();
        async move {
            controller.create_node(&node).await.map_err(|e| {
                warn!(node = %node.name, error = %e, "Node registration failed, will retry");
                e
            })
        }
    })
    .await;

    match outcome {
        Ok(response) => {
            info!(node = %response.name, "Node registered with the controller");
            response.topology_labels
        }
        // An unbounded backoff never gives up.
        Err(_) => node.topology_labels,
    }
}
