//! CSI Controller service.
//!
//! Mutating calls are deduplicated per volume or snapshot through the
//! driver's op caches, so a CO retrying while the first call is still running
//! gets the first call's answer instead of a second backend operation.
//! Listing calls read the catalog directly.

use std::collections::{BTreeMap, HashMap};

use csi_proto::v1;
use csi_proto::v1::controller_server::Controller;
use csi_proto::v1::controller_service_capability::{self, rpc};
use csi_proto::v1::volume_capability::AccessType;
use csi_proto::v1::volume_capability::access_mode::Mode;
use csi_proto::v1::volume_content_source;
use storage_core::{
    AccessMode, CsiAccessMode, Feature, OrchestratorError, Protocol, PublishRequest, Snapshot, Volume, VolumeMode,
    VolumeRequest, VolumeState, parse_snapshot_id, reduce_access_modes, snapshot_id,
};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::interceptor::unary;
use super::{CsiDriver, publish_context};
use crate::error::PluginError;

const CONTEXT_BACKEND_UUID: &str = "backendUUID";
const CONTEXT_INTERNAL_NAME: &str = "internalName";
const CONTEXT_NAME: &str = "name";
const CONTEXT_PROTOCOL: &str = "protocol";

type PResult<T> = Result<T, PluginError>;

/// Map a wire access mode; `None` for UNKNOWN or values this build does not know
pub(super) fn csi_access_mode(mode: i32) -> Option<CsiAccessMode> {
    match Mode::try_from(mode).ok()? {
        Mode::SingleNodeWriter => Some(CsiAccessMode::SingleNodeWriter),
        Mode::SingleNodeReaderOnly => Some(CsiAccessMode::SingleNodeReaderOnly),
        Mode::MultiNodeReaderOnly => Some(CsiAccessMode::MultiNodeReaderOnly),
        Mode::MultiNodeSingleWriter => Some(CsiAccessMode::MultiNodeSingleWriter),
        Mode::MultiNodeMultiWriter => Some(CsiAccessMode::MultiNodeMultiWriter),
        Mode::SingleNodeSingleWriter => Some(CsiAccessMode::SingleNodeSingleWriter),
        Mode::SingleNodeMultiWriter => Some(CsiAccessMode::SingleNodeMultiWriter),
        Mode::Unknown => None,
    }
}

fn requested_access_modes(capabilities: &[v1::VolumeCapability]) -> PResult<Vec<CsiAccessMode>> {
    capabilities
        .iter()
        .map(|capability| {
            let mode = capability.access_mode.as_ref().map_or(0, |m| m.mode);
            csi_access_mode(mode).ok_or_else(|| PluginError::invalid(format!("unsupported access mode {mode}")))
        })
        .collect()
}

/// True for a raw block capability
pub(super) fn is_block(capability: &v1::VolumeCapability) -> bool {
    matches!(capability.access_type, Some(AccessType::Block(_)))
}

/// Mount details of a filesystem capability
pub(super) fn mount_of(capability: &v1::VolumeCapability) -> Option<&v1::volume_capability::MountVolume> {
    match &capability.access_type {
        Some(AccessType::Mount(mount)) => Some(mount),
        _ => None,
    }
}

/// Requested size; `required_bytes` wins, then `limit_bytes`, 0 means default
pub(super) fn requested_size(range: Option<&v1::CapacityRange>) -> PResult<u64> {
    let Some(range) = range else {
        return Ok(0);
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(PluginError::invalid("capacity range must not be negative"));
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(OrchestratorError::CapacityOutOfRange(format!(
            "required {} bytes exceeds the limit of {} bytes",
            range.required_bytes, range.limit_bytes
        ))
        .into());
    }
    let size = if range.required_bytes > 0 {
        range.required_bytes
    } else {
        range.limit_bytes
    };
    u64::try_from(size).map_err(|e| PluginError::invalid(e.to_string()))
}

pub(super) fn bytes_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn segments(list: &[v1::Topology]) -> Vec<BTreeMap<String, String>> {
    list.iter()
        .map(|t| t.segments.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .collect()
}

fn csi_volume(volume: &Volume) -> v1::Volume {
    let config = &volume.config;
    let content_source = if !config.clone_source_snapshot.is_empty() {
        Some(volume_content_source::Type::Snapshot(volume_content_source::SnapshotSource {
            snapshot_id: snapshot_id(&config.clone_source_volume, &config.clone_source_snapshot),
        }))
    } else if !config.clone_source_volume.is_empty() {
        Some(volume_content_source::Type::Volume(volume_content_source::VolumeSource {
            volume_id: config.clone_source_volume.clone(),
        }))
    } else {
        None
    };

    v1::Volume {
        capacity_bytes: bytes_i64(config.size_bytes),
        volume_id: config.name.clone(),
        volume_context: HashMap::from([
            (CONTEXT_BACKEND_UUID.to_string(), volume.backend_uuid.clone()),
            (CONTEXT_INTERNAL_NAME.to_string(), config.internal_name.clone()),
            (CONTEXT_NAME.to_string(), config.name.clone()),
            (CONTEXT_PROTOCOL.to_string(), config.protocol.to_string()),
        ]),
        content_source: content_source.map(|t| v1::VolumeContentSource { r#type: Some(t) }),
        accessible_topology: config
            .requisite_topologies
            .iter()
            .map(|segments| v1::Topology {
                segments: segments.clone().into_iter().collect(),
            })
            .collect(),
    }
}

fn timestamp(rfc3339: &str) -> Option<prost_types::Timestamp> {
    let time = chrono::DateTime::parse_from_rfc3339(rfc3339).ok()?;
    Some(prost_types::Timestamp {
        seconds: time.timestamp(),
        nanos: i32::try_from(time.timestamp_subsec_nanos()).unwrap_or(0),
    })
}

fn csi_snapshot(snapshot: &Snapshot) -> v1::Snapshot {
    v1::Snapshot {
        size_bytes: bytes_i64(snapshot.size_bytes),
        snapshot_id: snapshot.config.id(),
        source_volume_id: snapshot.config.volume_name.clone(),
        creation_time: timestamp(&snapshot.created),
        ready_to_use: snapshot.state == storage_core::SnapshotState::Online,
        group_snapshot_id: String::new(),
    }
}

/// One page of `items`; the token is the index of the next entry
fn page<T>(mut items: Vec<T>, starting_token: &str, max_entries: i32) -> PResult<(Vec<T>, String)> {
    if max_entries < 0 {
        return Err(PluginError::invalid("max_entries must not be negative"));
    }
    let start = if starting_token.is_empty() {
        0
    } else {
        starting_token
            .parse::<usize>()
            .map_err(|_| PluginError::InvalidToken(starting_token.to_string()))?
    };
    if start > items.len() {
        return Err(PluginError::InvalidToken(starting_token.to_string()));
    }

    let mut rest = items.split_off(start);
    let limit = usize::try_from(max_entries).unwrap_or(0);
    let next_token = if limit > 0 && rest.len() > limit {
        rest.truncate(limit);
        (start + limit).to_string()
    } else {
        String::new()
    };
    Ok((rest, next_token))
}

fn rpc_capability(kind: rpc::Type) -> v1::ControllerServiceCapability {
    v1::ControllerServiceCapability {
        r#type: Some(controller_service_capability::Type::Rpc(controller_service_capability::Rpc {
            r#type: kind as i32,
        })),
    }
}

/// Why `capabilities` cannot be served by `volume`, if they cannot
fn incompatibility(volume: &Volume, capabilities: &[v1::VolumeCapability]) -> PResult<Option<String>> {
    let modes = requested_access_modes(capabilities)?;
    if capabilities.iter().any(is_block) && volume.config.protocol == Protocol::File {
        return Ok(Some("raw block access needs a block volume".to_string()));
    }
    let wanted = reduce_access_modes(&modes);
    let multi_node = matches!(wanted, AccessMode::ReadWriteMany | AccessMode::ReadOnlyMany);
    let single_node = matches!(
        volume.config.access_mode,
        AccessMode::ReadWriteOnce | AccessMode::ReadWriteOncePod
    );
    if multi_node && single_node {
        return Ok(Some(format!(
            "volume was created for {:?} access",
            volume.config.access_mode
        )));
    }
    Ok(None)
}

impl CsiDriver {
    async fn create_volume_op(&self, req: v1::CreateVolumeRequest) -> PResult<v1::CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(PluginError::invalid("volume name is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(PluginError::invalid("volume capabilities are required"));
        }
        let parts = self.controller_parts()?;
        let size = requested_size(req.capacity_range.as_ref())?;

        match parts.orchestrator.get_volume(&req.name).await {
            Ok(existing) => {
                if size > 0 && existing.config.size_bytes < size {
                    warn!(volume = %req.name, existing = existing.config.size_bytes, size, "Volume exists with a smaller size");
                    return Err(OrchestratorError::already_exists("volume", &req.name).into());
                }
                debug!(volume = %req.name, "Volume already exists");
                return Ok(v1::CreateVolumeResponse {
                    volume: Some(csi_volume(&existing)),
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let access_modes = requested_access_modes(&req.volume_capabilities)?;
        let block = req.volume_capabilities.iter().any(is_block);
        if block && !parts.helper.supports_feature(Feature::BlockVolumes) {
            return Err(OrchestratorError::Unsupported("raw block volumes".to_string()).into());
        }
        let fs_type = req
            .volume_capabilities
            .iter()
            .find_map(mount_of)
            .map(|m| m.fs_type.clone())
            .unwrap_or_default();

        let (clone_source_volume, clone_source_snapshot) =
            match req.volume_content_source.as_ref().and_then(|s| s.r#type.as_ref()) {
                Some(volume_content_source::Type::Snapshot(source)) => {
                    let (volume, snapshot) = parse_snapshot_id(&source.snapshot_id)
                        .ok_or_else(|| OrchestratorError::not_found("snapshot", &source.snapshot_id))?;
                    (volume.to_string(), snapshot.to_string())
                }
                Some(volume_content_source::Type::Volume(source)) => (source.volume_id.clone(), String::new()),
                None => (String::new(), String::new()),
            };

        let (requisite_topologies, preferred_topologies) = req
            .accessibility_requirements
            .as_ref()
            .map(|r| (segments(&r.requisite), segments(&r.preferred)))
            .unwrap_or_default();

        let request = VolumeRequest {
            name: req.name.clone(),
            size_bytes: size,
            parameters: req.parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            access_modes,
            volume_mode: if block { VolumeMode::RawBlock } else { VolumeMode::Filesystem },
            fs_type,
            clone_source_volume,
            clone_source_snapshot,
            requisite_topologies,
            preferred_topologies,
        };
        let config = parts.helper.get_volume_config(&request).await?;

        let volume = if !config.import_original_name.is_empty() {
            info!(volume = %config.name, original = %config.import_original_name, "Importing volume");
            parts.orchestrator.import_volume(config).await?
        } else if !config.clone_source_volume.is_empty() {
            info!(volume = %config.name, source = %config.clone_source_volume, "Cloning volume");
            parts.orchestrator.clone_volume(config).await?
        } else {
            parts.orchestrator.add_volume(config).await?
        };
        Ok(v1::CreateVolumeResponse {
            volume: Some(csi_volume(&volume)),
        })
    }

    async fn delete_volume_op(&self, req: v1::DeleteVolumeRequest) -> PResult<v1::DeleteVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(PluginError::invalid("volume id is required"));
        }
        match self.controller_parts()?.orchestrator.delete_volume(&req.volume_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(volume = %req.volume_id, "Volume already gone"),
            Err(e) => return Err(e.into()),
        }
        Ok(v1::DeleteVolumeResponse {})
    }

    async fn controller_publish_op(
        &self,
        req: v1::ControllerPublishVolumeRequest,
    ) -> PResult<v1::ControllerPublishVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(PluginError::invalid("volume id is required"));
        }
        if req.node_id.is_empty() {
            return Err(PluginError::invalid("node id is required"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| PluginError::invalid("volume capability is required"))?;
        let access_mode = reduce_access_modes(&requested_access_modes(std::slice::from_ref(capability))?);

        let parts = self.controller_parts()?;
        let volume = parts.orchestrator.get_volume(&req.volume_id).await?;
        let mut info = parts
            .orchestrator
            .publish_volume(
                &req.volume_id,
                PublishRequest {
                    node_name: req.node_id.clone(),
                    read_only: req.readonly,
                    access_mode,
                },
            )
            .await?;

        if info.fs_type.is_empty() && !is_block(capability) {
            info.fs_type = mount_of(capability)
                .map(|m| m.fs_type.clone())
                .filter(|fs| !fs.is_empty())
                .unwrap_or(volume.config.fs_type);
        }
        let publish_context = publish_context::encode(&info, &self.inner.cipher)?;
        info!(volume = %req.volume_id, node = %req.node_id, protocol = %info.protocol, "Volume published");
        Ok(v1::ControllerPublishVolumeResponse { publish_context })
    }

    async fn controller_unpublish_op(
        &self,
        req: v1::ControllerUnpublishVolumeRequest,
    ) -> PResult<v1::ControllerUnpublishVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(PluginError::invalid("volume id is required"));
        }
        let orchestrator = &self.controller_parts()?.orchestrator;

        // An empty node id means every node
        let nodes = if req.node_id.is_empty() {
            match orchestrator.list_volume_publications_for_volume(&req.volume_id).await {
                Ok(publications) => publications.into_iter().map(|p| p.node_name).collect(),
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e.into()),
            }
        } else {
            vec![req.node_id.clone()]
        };

        for node in nodes {
            match orchestrator.unpublish_volume(&req.volume_id, &node).await {
                Ok(()) => info!(volume = %req.volume_id, node = %node, "Volume unpublished"),
                Err(e) if e.is_not_found() => debug!(volume = %req.volume_id, node = %node, "Nothing to unpublish"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(v1::ControllerUnpublishVolumeResponse {})
    }

    async fn validate_op(
        &self,
        req: v1::ValidateVolumeCapabilitiesRequest,
    ) -> PResult<v1::ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(PluginError::invalid("volume id is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(PluginError::invalid("volume capabilities are required"));
        }
        let volume = self.controller_parts()?.orchestrator.get_volume(&req.volume_id).await?;

        Ok(match incompatibility(&volume, &req.volume_capabilities)? {
            Some(message) => v1::ValidateVolumeCapabilitiesResponse { confirmed: None, message },
            None => v1::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(v1::validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                    mutable_parameters: req.mutable_parameters,
                }),
                message: String::new(),
            },
        })
    }

    async fn published_nodes(&self) -> PResult<BTreeMap<String, Vec<String>>> {
        let mut published: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for publication in self.controller_parts()?.orchestrator.list_volume_publications().await? {
            published
                .entry(publication.volume_name)
                .or_default()
                .push(publication.node_name);
        }
        Ok(published)
    }

    async fn list_volumes_op(&self, req: v1::ListVolumesRequest) -> PResult<v1::ListVolumesResponse> {
        let mut volumes = self.controller_parts()?.orchestrator.list_volumes().await?;
        volumes.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        let (volumes, next_token) = page(volumes, &req.starting_token, req.max_entries)?;
        let mut published = self.published_nodes().await?;

        let entries = volumes
            .iter()
            .map(|volume| v1::list_volumes_response::Entry {
                volume: Some(csi_volume(volume)),
                status: Some(v1::list_volumes_response::VolumeStatus {
                    published_node_ids: published.remove(&volume.config.name).unwrap_or_default(),
                    volume_condition: None,
                }),
            })
            .collect();
        Ok(v1::ListVolumesResponse { entries, next_token })
    }

    async fn get_volume_op(&self, req: v1::ControllerGetVolumeRequest) -> PResult<v1::ControllerGetVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(PluginError::invalid("volume id is required"));
        }
        let orchestrator = &self.controller_parts()?.orchestrator;
        let volume = orchestrator.get_volume(&req.volume_id).await?;
        let published_node_ids = orchestrator
            .list_volume_publications_for_volume(&req.volume_id)
            .await?
            .into_iter()
            .map(|p| p.node_name)
            .collect();

        let abnormal = volume.state == VolumeState::MissingBackend;
        Ok(v1::ControllerGetVolumeResponse {
            volume: Some(csi_volume(&volume)),
            status: Some(v1::controller_get_volume_response::VolumeStatus {
                published_node_ids,
                volume_condition: Some(v1::VolumeCondition {
                    abnormal,
                    message: if abnormal {
                        "backend for the volume is missing".to_string()
                    } else {
                        String::new()
                    },
                }),
            }),
        })
    }

    async fn create_snapshot_op(&self, req: v1::CreateSnapshotRequest) -> PResult<v1::CreateSnapshotResponse> {
        if req.source_volume_id.is_empty() {
            return Err(PluginError::invalid("source volume id is required"));
        }
        if req.name.is_empty() {
            return Err(PluginError::invalid("snapshot name is required"));
        }
        let parts = self.controller_parts()?;
        if !parts.helper.supports_feature(Feature::VolumeSnapshots) {
            return Err(OrchestratorError::Unsupported("volume snapshots".to_string()).into());
        }

        // Snapshot names are unique across volumes
        let existing = parts
            .orchestrator
            .list_snapshots()
            .await?
            .into_iter()
            .find(|s| s.config.name == req.name);
        if let Some(existing) = existing {
            if existing.config.volume_name != req.source_volume_id {
                return Err(OrchestratorError::already_exists("snapshot", &req.name).into());
            }
            debug!(snapshot = %existing.config.id(), "Snapshot already exists");
            return Ok(v1::CreateSnapshotResponse {
                snapshot: Some(csi_snapshot(&existing)),
            });
        }

        let config = parts.helper.get_snapshot_config(&req.source_volume_id, &req.name).await?;
        let snapshot = parts.orchestrator.create_snapshot(config).await?;
        info!(snapshot = %snapshot.config.id(), "Snapshot created");
        Ok(v1::CreateSnapshotResponse {
            snapshot: Some(csi_snapshot(&snapshot)),
        })
    }

    async fn delete_snapshot_op(&self, req: v1::DeleteSnapshotRequest) -> PResult<v1::DeleteSnapshotResponse> {
        if req.snapshot_id.is_empty() {
            return Err(PluginError::invalid("snapshot id is required"));
        }
        let Some((volume, snapshot)) = parse_snapshot_id(&req.snapshot_id) else {
            debug!(snapshot = %req.snapshot_id, "Malformed snapshot id, nothing to delete");
            return Ok(v1::DeleteSnapshotResponse {});
        };
        match self.controller_parts()?.orchestrator.delete_snapshot(volume, snapshot).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(snapshot = %req.snapshot_id, "Snapshot already gone"),
            Err(e) => return Err(e.into()),
        }
        Ok(v1::DeleteSnapshotResponse {})
    }

    async fn list_snapshots_op(&self, req: v1::ListSnapshotsRequest) -> PResult<v1::ListSnapshotsResponse> {
        let orchestrator = &self.controller_parts()?.orchestrator;
        let found = if !req.snapshot_id.is_empty() {
            match parse_snapshot_id(&req.snapshot_id) {
                Some((volume, snapshot)) => orchestrator.get_snapshot(volume, snapshot).await.map(|s| vec![s]),
                None => Ok(Vec::new()),
            }
        } else if !req.source_volume_id.is_empty() {
            orchestrator.list_snapshots_for_volume(&req.source_volume_id).await
        } else {
            orchestrator.list_snapshots().await
        };
        let mut snapshots = match found {
            Ok(snapshots) => snapshots,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        snapshots.sort_by_key(|s| s.config.id());
        let (snapshots, next_token) = page(snapshots, &req.starting_token, req.max_entries)?;
        Ok(v1::ListSnapshotsResponse {
            entries: snapshots
                .iter()
                .map(|s| v1::list_snapshots_response::Entry {
                    snapshot: Some(csi_snapshot(s)),
                })
                .collect(),
            next_token,
        })
    }

    async fn expand_op(&self, req: v1::ControllerExpandVolumeRequest) -> PResult<v1::ControllerExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(PluginError::invalid("volume id is required"));
        }
        let size = requested_size(req.capacity_range.as_ref())?;
        if size == 0 {
            return Err(PluginError::invalid("capacity range is required"));
        }
        let parts = self.controller_parts()?;
        if !parts.helper.supports_feature(Feature::ExpandVolume) {
            return Err(OrchestratorError::Unsupported("volume expansion".to_string()).into());
        }

        let volume = parts.orchestrator.resize_volume(&req.volume_id, size).await?;
        let raw_access = req.volume_capability.as_ref().is_some_and(is_block);
        // Block filesystems are grown on the node once the LUN is bigger
        let node_expansion_required = volume.config.protocol == Protocol::Block
            && volume.config.volume_mode == VolumeMode::Filesystem
            && !raw_access;

        info!(volume = %req.volume_id, size = volume.config.size_bytes, node_expansion_required, "Volume expanded");
        Ok(v1::ControllerExpandVolumeResponse {
            capacity_bytes: bytes_i64(volume.config.size_bytes),
            node_expansion_required,
        })
    }
}

#[tonic::async_trait]
impl Controller for CsiDriver {
    async fn create_volume(
        &self,
        request: Request<v1::CreateVolumeRequest>,
    ) -> Result<Response<v1::CreateVolumeResponse>, Status> {
        unary("CreateVolume", request, |req| async move {
            let driver = self.clone();
            let key = req.name.clone();
            self.ops()
                .create_volume
                .run("CreateVolume", &key, async move {
                    driver.create_volume_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn delete_volume(
        &self,
        request: Request<v1::DeleteVolumeRequest>,
    ) -> Result<Response<v1::DeleteVolumeResponse>, Status> {
        unary("DeleteVolume", request, |req| async move {
            let driver = self.clone();
            let key = req.volume_id.clone();
            self.ops()
                .delete_volume
                .run("DeleteVolume", &key, async move {
                    driver.delete_volume_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<v1::ControllerPublishVolumeRequest>,
    ) -> Result<Response<v1::ControllerPublishVolumeResponse>, Status> {
        unary("ControllerPublishVolume", request, |req| async move {
            let driver = self.clone();
            let key = format!("{}/{}", req.volume_id, req.node_id);
            self.ops()
                .publish
                .run("ControllerPublishVolume", &key, async move {
                    driver.controller_publish_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<v1::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<v1::ControllerUnpublishVolumeResponse>, Status> {
        unary("ControllerUnpublishVolume", request, |req| async move {
            let driver = self.clone();
            let key = format!("{}/{}", req.volume_id, req.node_id);
            self.ops()
                .unpublish
                .run("ControllerUnpublishVolume", &key, async move {
                    driver.controller_unpublish_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<v1::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<v1::ValidateVolumeCapabilitiesResponse>, Status> {
        unary("ValidateVolumeCapabilities", request, |req| async move {
            self.validate_op(req).await.map_err(Status::from)
        })
        .await
    }

    async fn list_volumes(
        &self,
        request: Request<v1::ListVolumesRequest>,
    ) -> Result<Response<v1::ListVolumesResponse>, Status> {
        unary("ListVolumes", request, |req| async move {
            self.list_volumes_op(req).await.map_err(Status::from)
        })
        .await
    }

    async fn get_capacity(
        &self,
        request: Request<v1::GetCapacityRequest>,
    ) -> Result<Response<v1::GetCapacityResponse>, Status> {
        // Backends are thin provisioned; capacity is not tracked
        unary("GetCapacity", request, |_| async {
            Ok(v1::GetCapacityResponse {
                available_capacity: 0,
                maximum_volume_size: None,
                minimum_volume_size: None,
            })
        })
        .await
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<v1::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<v1::ControllerGetCapabilitiesResponse>, Status> {
        unary("ControllerGetCapabilities", request, |_| async {
            Ok(v1::ControllerGetCapabilitiesResponse {
                capabilities: [
                    rpc::Type::CreateDeleteVolume,
                    rpc::Type::PublishUnpublishVolume,
                    rpc::Type::ListVolumes,
                    rpc::Type::ListVolumesPublishedNodes,
                    rpc::Type::GetVolume,
                    rpc::Type::VolumeCondition,
                    rpc::Type::CreateDeleteSnapshot,
                    rpc::Type::ListSnapshots,
                    rpc::Type::CloneVolume,
                    rpc::Type::ExpandVolume,
                    rpc::Type::PublishReadonly,
                ]
                .into_iter()
                .map(rpc_capability)
                .collect(),
            })
        })
        .await
    }

    async fn create_snapshot(
        &self,
        request: Request<v1::CreateSnapshotRequest>,
    ) -> Result<Response<v1::CreateSnapshotResponse>, Status> {
        unary("CreateSnapshot", request, |req| async move {
            let driver = self.clone();
            let key = snapshot_id(&req.source_volume_id, &req.name);
            self.ops()
                .create_snapshot
                .run("CreateSnapshot", &key, async move {
                    driver.create_snapshot_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn delete_snapshot(
        &self,
        request: Request<v1::DeleteSnapshotRequest>,
    ) -> Result<Response<v1::DeleteSnapshotResponse>, Status> {
        unary("DeleteSnapshot", request, |req| async move {
            let driver = self.clone();
            let key = req.snapshot_id.clone();
            self.ops()
                .delete_snapshot
                .run("DeleteSnapshot", &key, async move {
                    driver.delete_snapshot_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn list_snapshots(
        &self,
        request: Request<v1::ListSnapshotsRequest>,
    ) -> Result<Response<v1::ListSnapshotsResponse>, Status> {
        unary("ListSnapshots", request, |req| async move {
            self.list_snapshots_op(req).await.map_err(Status::from)
        })
        .await
    }

    async fn controller_expand_volume(
        &self,
        request: Request<v1::ControllerExpandVolumeRequest>,
    ) -> Result<Response<v1::ControllerExpandVolumeResponse>, Status> {
        unary("ControllerExpandVolume", request, |req| async move {
            let driver = self.clone();
            let key = req.volume_id.clone();
            self.ops()
                .expand
                .run("ControllerExpandVolume", &key, async move {
                    driver.expand_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn controller_get_volume(
        &self,
        request: Request<v1::ControllerGetVolumeRequest>,
    ) -> Result<Response<v1::ControllerGetVolumeResponse>, Status> {
        unary("ControllerGetVolume", request, |req| async move {
            self.get_volume_op(req).await.map_err(Status::from)
        })
        .await
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::test_support;
    use std::sync::Arc;
    use storage_core::{CatalogOrchestrator, Node, NodePublicationState, Orchestrator};
    use tonic::Code;

    fn mount_capability(mode: Mode) -> v1::VolumeCapability {
        v1::VolumeCapability {
            access_type: Some(AccessType::Mount(v1::volume_capability::MountVolume {
                fs_type: "ext4".into(),
                ..Default::default()
            })),
            access_mode: Some(v1::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    fn block_capability() -> v1::VolumeCapability {
        v1::VolumeCapability {
            access_type: Some(AccessType::Block(v1::volume_capability::BlockVolume {})),
            access_mode: Some(v1::volume_capability::AccessMode {
                mode: Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn create_request(name: &str) -> v1::CreateVolumeRequest {
        v1::CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(v1::CapacityRange {
                required_bytes: 1 << 30,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
            ..Default::default()
        }
    }

    async fn create(driver: &CsiDriver, name: &str) -> v1::Volume {
        driver
            .create_volume(Request::new(create_request(name)))
            .await
            .expect("create")
            .into_inner()
            .volume
            .expect("volume")
    }

    async fn add_ready_node(catalog: &CatalogOrchestrator, name: &str) {
        catalog
            .add_node(Node {
                name: name.into(),
                iqn: format!("iqn.2024-01.io.example:{name}"),
                publication_state: NodePublicationState::Ready,
                ..Default::default()
            })
            .await
            .expect("node");
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_one_backend_call() {
        let (catalog, fake) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);

        let (first, second) = tokio::join!(
            driver.create_volume(Request::new(create_request("vol-1"))),
            driver.create_volume(Request::new(create_request("vol-1"))),
        );
        let first = first.expect("first").into_inner();
        let second = second.expect("second").into_inner();

        assert_eq!(fake.create_count(), 1);
        assert_eq!(first, second);
        let volume = first.volume.expect("volume");
        assert_eq!(volume.volume_id, "vol-1");
        assert_eq!(volume.capacity_bytes, 1 << 30);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_but_rejects_a_bigger_size() {
        let (catalog, fake) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        create(&driver, "vol-1").await;
        create(&driver, "vol-1").await;
        assert_eq!(fake.create_count(), 1);

        let mut bigger = create_request("vol-1");
        bigger.capacity_range = Some(v1::CapacityRange {
            required_bytes: 2 << 30,
            limit_bytes: 0,
        });
        let status = driver.create_volume(Request::new(bigger)).await.expect_err("size");
        assert_eq!(status.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_import_from_an_unknown_backend_is_not_found() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);

        let mut request = create_request("vol-imported");
        request.parameters = HashMap::from([
            ("importOriginalName".to_string(), "lun7".to_string()),
            ("importBackend".to_string(), "bogus".to_string()),
        ]);
        let status = driver.create_volume(Request::new(request)).await.expect_err("bogus");
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("bogus"), "{}", status.message());
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);

        let status = driver
            .create_volume(Request::new(v1::CreateVolumeRequest::default()))
            .await
            .expect_err("no name");
        assert_eq!(status.code(), Code::InvalidArgument);

        let mut inverted = create_request("vol-1");
        inverted.capacity_range = Some(v1::CapacityRange {
            required_bytes: 10,
            limit_bytes: 5,
        });
        let status = driver.create_volume(Request::new(inverted)).await.expect_err("range");
        assert_eq!(status.code(), Code::OutOfRange);

        let mut unknown_mode = create_request("vol-1");
        unknown_mode.volume_capabilities = vec![mount_capability(Mode::Unknown)];
        let status = driver.create_volume(Request::new(unknown_mode)).await.expect_err("mode");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_delete_of_a_missing_volume_succeeds() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog.clone());
        create(&driver, "vol-1").await;

        for _ in 0..2 {
            driver
                .delete_volume(Request::new(v1::DeleteVolumeRequest {
                    volume_id: "vol-1".into(),
                    ..Default::default()
                }))
                .await
                .expect("delete");
        }
        assert!(catalog.get_volume("vol-1").await.expect_err("gone").is_not_found());
    }

    #[tokio::test]
    async fn test_block_publish_carries_iscsi_and_chap() {
        let fake = Arc::new(storage_core::FakeDriver::new());
        let catalog = Arc::new(CatalogOrchestrator::new(
            Arc::new(storage_core::InMemoryStore::new()),
            Arc::new(storage_core::BuiltinDriverFactory::new(fake)),
        ));
        catalog.bootstrap().await.expect("bootstrap");
        catalog
            .add_backend(
                "san",
                "fake",
                serde_json::json!({ "protocol": "block", "requiresChap": true }),
            )
            .await
            .expect("backend");
        add_ready_node(&catalog, "n1").await;
        let driver = test_support::controller_driver(catalog.clone());

        let mut request = create_request("vol-1");
        request.volume_capabilities = vec![block_capability()];
        driver.create_volume(Request::new(request)).await.expect("create");

        let context = driver
            .controller_publish_volume(Request::new(v1::ControllerPublishVolumeRequest {
                volume_id: "vol-1".into(),
                node_id: "n1".into(),
                volume_capability: Some(block_capability()),
                ..Default::default()
            }))
            .await
            .expect("publish")
            .into_inner()
            .publish_context;

        assert_eq!(context.get(publish_context::PROTOCOL).map(String::as_str), Some("block"));
        assert!(context.contains_key(publish_context::ISCSI_TARGET_IQN));
        assert_eq!(context.get(publish_context::ISCSI_LUN).map(String::as_str), Some("0"));
        assert!(context.contains_key(crate::crypto::INITIATOR_SECRET));
        assert!(!context.contains_key(publish_context::NFS_PATH));

        let publications = catalog
            .list_volume_publications_for_volume("vol-1")
            .await
            .expect("publications");
        assert_eq!(publications.len(), 1);

        driver
            .controller_unpublish_volume(Request::new(v1::ControllerUnpublishVolumeRequest {
                volume_id: "vol-1".into(),
                node_id: String::new(),
                ..Default::default()
            }))
            .await
            .expect("unpublish everywhere");
        assert!(
            catalog
                .list_volume_publications_for_volume("vol-1")
                .await
                .expect("publications")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_file_publish_carries_the_export() {
        let (catalog, _) = test_support::catalog("file").await;
        add_ready_node(&catalog, "n1").await;
        let driver = test_support::controller_driver(catalog);
        let volume = create(&driver, "vol-1").await;

        let context = driver
            .controller_publish_volume(Request::new(v1::ControllerPublishVolumeRequest {
                volume_id: "vol-1".into(),
                node_id: "n1".into(),
                volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
                ..Default::default()
            }))
            .await
            .expect("publish")
            .into_inner()
            .publish_context;

        let internal = &volume.volume_context[CONTEXT_INTERNAL_NAME];
        assert_eq!(
            context.get(publish_context::NFS_PATH).map(String::as_str),
            Some(format!("/{internal}").as_str())
        );
        assert_eq!(context.get(publish_context::FILESYSTEM).map(String::as_str), Some("ext4"));
    }

    #[tokio::test]
    async fn test_publish_to_an_unknown_node_is_not_found() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        create(&driver, "vol-1").await;

        let status = driver
            .controller_publish_volume(Request::new(v1::ControllerPublishVolumeRequest {
                volume_id: "vol-1".into(),
                node_id: "ghost".into(),
                volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
                ..Default::default()
            }))
            .await
            .expect_err("no node");
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_list_volumes_pages_by_index() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        for name in ["vol-c", "vol-a", "vol-b"] {
            create(&driver, name).await;
        }

        let list = |token: &str, max: i32| {
            driver.list_volumes(Request::new(v1::ListVolumesRequest {
                max_entries: max,
                starting_token: token.to_string(),
            }))
        };

        let first = list("", 2).await.expect("page 1").into_inner();
        let ids: Vec<_> = first
            .entries
            .iter()
            .filter_map(|e| e.volume.as_ref().map(|v| v.volume_id.clone()))
            .collect();
        assert_eq!(ids, vec!["vol-a", "vol-b"]);
        assert_eq!(first.next_token, "2");

        let second = list(&first.next_token, 2).await.expect("page 2").into_inner();
        assert_eq!(second.entries.len(), 1);
        assert!(second.next_token.is_empty());

        let status = list("nope", 2).await.expect_err("bad token");
        assert_eq!(status.code(), Code::Aborted);
        let status = list("", -1).await.expect_err("negative");
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        create(&driver, "vol-1").await;
        create(&driver, "vol-2").await;

        let snapshot = driver
            .create_snapshot(Request::new(v1::CreateSnapshotRequest {
                source_volume_id: "vol-1".into(),
                name: "snap-1".into(),
                ..Default::default()
            }))
            .await
            .expect("snapshot")
            .into_inner()
            .snapshot
            .expect("snapshot");
        assert_eq!(snapshot.snapshot_id, "vol-1/snap-1");
        assert!(snapshot.ready_to_use);
        assert!(snapshot.creation_time.is_some());

        let status = driver
            .create_snapshot(Request::new(v1::CreateSnapshotRequest {
                source_volume_id: "vol-2".into(),
                name: "snap-1".into(),
                ..Default::default()
            }))
            .await
            .expect_err("name taken");
        assert_eq!(status.code(), Code::AlreadyExists);

        let listed = driver
            .list_snapshots(Request::new(v1::ListSnapshotsRequest {
                snapshot_id: "vol-1/snap-1".into(),
                ..Default::default()
            }))
            .await
            .expect("list")
            .into_inner();
        assert_eq!(listed.entries.len(), 1);

        let status = driver
            .delete_volume(Request::new(v1::DeleteVolumeRequest {
                volume_id: "vol-1".into(),
                ..Default::default()
            }))
            .await
            .expect_err("has snapshots");
        assert_eq!(status.code(), Code::FailedPrecondition);

        for id in ["vol-1/snap-1", "vol-1/snap-1", "not-a-snapshot-id"] {
            driver
                .delete_snapshot(Request::new(v1::DeleteSnapshotRequest {
                    snapshot_id: id.into(),
                    ..Default::default()
                }))
                .await
                .expect("delete snapshot");
        }

        let listed = driver
            .list_snapshots(Request::new(v1::ListSnapshotsRequest {
                source_volume_id: "vol-1".into(),
                ..Default::default()
            }))
            .await
            .expect("list")
            .into_inner();
        assert!(listed.entries.is_empty());
    }

    #[tokio::test]
    async fn test_clone_from_snapshot_reports_its_source() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        create(&driver, "vol-1").await;
        driver
            .create_snapshot(Request::new(v1::CreateSnapshotRequest {
                source_volume_id: "vol-1".into(),
                name: "snap-1".into(),
                ..Default::default()
            }))
            .await
            .expect("snapshot");

        let mut request = create_request("vol-clone");
        request.volume_content_source = Some(v1::VolumeContentSource {
            r#type: Some(volume_content_source::Type::Snapshot(volume_content_source::SnapshotSource {
                snapshot_id: "vol-1/snap-1".into(),
            })),
        });
        let volume = driver
            .create_volume(Request::new(request))
            .await
            .expect("clone")
            .into_inner()
            .volume
            .expect("volume");
        assert!(matches!(
            volume.content_source.and_then(|s| s.r#type),
            Some(volume_content_source::Type::Snapshot(s)) if s.snapshot_id == "vol-1/snap-1"
        ));

        let mut malformed = create_request("vol-clone-2");
        malformed.volume_content_source = Some(v1::VolumeContentSource {
            r#type: Some(volume_content_source::Type::Snapshot(volume_content_source::SnapshotSource {
                snapshot_id: "garbage".into(),
            })),
        });
        let status = driver.create_volume(Request::new(malformed)).await.expect_err("malformed");
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_expand_asks_for_node_expansion_on_block_filesystems() {
        let (catalog, _) = test_support::catalog("block").await;
        let driver = test_support::controller_driver(catalog);
        create(&driver, "vol-1").await;

        let response = driver
            .controller_expand_volume(Request::new(v1::ControllerExpandVolumeRequest {
                volume_id: "vol-1".into(),
                capacity_range: Some(v1::CapacityRange {
                    required_bytes: 2 << 30,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .expect("expand")
            .into_inner();
        assert_eq!(response.capacity_bytes, 2 << 30);
        assert!(response.node_expansion_required);

        let status = driver
            .controller_expand_volume(Request::new(v1::ControllerExpandVolumeRequest {
                volume_id: "vol-1".into(),
                capacity_range: Some(v1::CapacityRange {
                    required_bytes: 1 << 20,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .expect_err("shrink");
        assert_eq!(status.code(), Code::OutOfRange);
    }

    #[tokio::test]
    async fn test_validate_rejects_block_access_on_a_file_volume() {
        let (catalog, _) = test_support::catalog("file").await;
        let driver = test_support::controller_driver(catalog);
        create(&driver, "vol-1").await;

        let validate = |capability: v1::VolumeCapability| {
            driver.validate_volume_capabilities(Request::new(v1::ValidateVolumeCapabilitiesRequest {
                volume_id: "vol-1".into(),
                volume_capabilities: vec![capability],
                ..Default::default()
            }))
        };

        let rejected = validate(block_capability()).await.expect("validate").into_inner();
        assert!(rejected.confirmed.is_none());
        assert!(!rejected.message.is_empty());

        let multi = validate(mount_capability(Mode::MultiNodeMultiWriter)).await.expect("validate");
        assert!(multi.into_inner().confirmed.is_none());

        let confirmed = validate(mount_capability(Mode::SingleNodeWriter)).await.expect("validate");
        assert!(confirmed.into_inner().confirmed.is_some());
    }

    #[tokio::test]
    async fn test_get_volume_reports_published_nodes() {
        let (catalog, _) = test_support::catalog("file").await;
        add_ready_node(&catalog, "n1").await;
        let driver = test_support::controller_driver(catalog);
        create(&driver, "vol-1").await;
        driver
            .controller_publish_volume(Request::new(v1::ControllerPublishVolumeRequest {
                volume_id: "vol-1".into(),
                node_id: "n1".into(),
                volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
                ..Default::default()
            }))
            .await
            .expect("publish");

        let response = driver
            .controller_get_volume(Request::new(v1::ControllerGetVolumeRequest {
                volume_id: "vol-1".into(),
            }))
            .await
            .expect("get")
            .into_inner();
        let status = response.status.expect("status");
        assert_eq!(status.published_node_ids, vec!["n1"]);
        assert_eq!(status.volume_condition.map(|c| c.abnormal), Some(false));
    }

    #[test]
    fn test_paging_helper_edges() {
        let (items, token) = page(vec![1, 2, 3], "3", 0).expect("end");
        assert!(items.is_empty());
        assert!(token.is_empty());
        assert!(matches!(page(vec![1], "5", 0), Err(PluginError::InvalidToken(_))));
    }
}
