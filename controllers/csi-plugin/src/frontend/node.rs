//! CSI Node service.
//!
//! Block volumes are attached at stage time (iSCSI login, optional LUKS open,
//! format and mount on the staging path) and bind mounted into each target at
//! publish time. File volumes are mounted straight into the target. Every
//! staged volume leaves a tracking record, which unstage and the iSCSI
//! self-healing loop read back.

use std::path::{Path, PathBuf};

use csi_proto::v1;
use csi_proto::v1::node_server::Node;
use csi_proto::v1::node_service_capability::{self, rpc};
use csi_proto::v1::volume_usage;
use storage_core::api::VolumePublicationUpdate;
use storage_core::{OrchestratorError, Protocol};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::controller::{bytes_i64, is_block, mount_of, requested_size};
use super::interceptor::unary;
use super::{CsiDriver, NodeParts, publish_context};
use crate::error::PluginError;
use crate::node::luks::LUKS_PASSPHRASE;
use crate::node::{IscsiTarget, LuksSecrets, TrackingRecord, luks_mapper_name};

const DEFAULT_FS_TYPE: &str = "ext4";

type PResult<T> = Result<T, PluginError>;

fn required<'a>(value: &'a str, what: &str) -> PResult<&'a str> {
    if value.is_empty() {
        return Err(PluginError::invalid(format!("{what} is required")));
    }
    Ok(value)
}

fn mount_options(record_options: &str, capability: Option<&v1::VolumeCapability>) -> Vec<String> {
    let mut options: Vec<String> = record_options
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect();
    if let Some(mount) = capability.and_then(mount_of) {
        for flag in &mount.mount_flags {
            if !options.contains(flag) {
                options.push(flag.clone());
            }
        }
    }
    options
}

fn iscsi_target(record: &TrackingRecord) -> IscsiTarget {
    let info = &record.publish_info;
    let mut portals = Vec::new();
    for portal in std::iter::once(&info.iscsi_target_portal).chain(&info.iscsi_portals) {
        if !portal.is_empty() && !portals.contains(portal) {
            portals.push(portal.clone());
        }
    }
    IscsiTarget {
        target_iqn: info.iscsi_target_iqn.clone(),
        portals,
        lun: info.iscsi_lun,
        chap: info.chap.clone(),
    }
}

/// Remove a publish target, file or directory; a missing one is fine
async fn remove_target(path: &Path) -> PResult<()> {
    let removed = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn rpc_capability(kind: rpc::Type) -> v1::NodeServiceCapability {
    v1::NodeServiceCapability {
        r#type: Some(node_service_capability::Type::Rpc(node_service_capability::Rpc {
            r#type: kind as i32,
        })),
    }
}

impl CsiDriver {
    async fn stage_block(
        &self,
        parts: &NodeParts,
        req: &v1::NodeStageVolumeRequest,
        capability: &v1::VolumeCapability,
        record: &mut TrackingRecord,
    ) -> PResult<()> {
        let target = iscsi_target(record);
        let device = parts.host.iscsi_login(&target).await?;
        record.iscsi = Some(target);
        record.device_path = Some(device.clone());

        let mut usable = device.clone();
        if record.publish_info.luks_encryption {
            let secrets = LuksSecrets::from_secrets(&req.secrets)?;
            let mapper = luks_mapper_name(&req.volume_id);
            let opened = match parts.host.luks_open(&device, &mapper, &secrets.current.value).await {
                Ok(path) => {
                    record.luks_passphrase_names = parts
                        .luks
                        .ensure_volume_passphrase(&req.volume_id, &device, &secrets, true)
                        .await?;
                    path
                }
                Err(PluginError::NoWorkingPassphrase) => {
                    record.luks_passphrase_names = parts
                        .luks
                        .ensure_volume_passphrase(&req.volume_id, &device, &secrets, false)
                        .await?;
                    parts.host.luks_open(&device, &mapper, &secrets.current.value).await?
                }
                Err(e) => return Err(e),
            };
            record.luks_device = Some(opened.clone());
            usable = opened;
        }

        if record.raw_block {
            return Ok(());
        }

        let fs_type = if record.publish_info.fs_type.is_empty() {
            mount_of(capability)
                .map(|m| m.fs_type.clone())
                .filter(|fs| !fs.is_empty())
                .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string())
        } else {
            record.publish_info.fs_type.clone()
        };
        parts.host.format_if_needed(&usable, &fs_type).await?;
        tokio::fs::create_dir_all(&record.staging_path).await?;
        let options = mount_options(&record.publish_info.mount_options, Some(capability));
        parts
            .host
            .mount(&usable.to_string_lossy(), &record.staging_path, &fs_type, &options)
            .await?;
        record.publish_info.fs_type = fs_type;
        Ok(())
    }

    async fn stage_op(&self, req: v1::NodeStageVolumeRequest) -> PResult<v1::NodeStageVolumeResponse> {
        let volume_id = required(&req.volume_id, "volume id")?;
        let staging = PathBuf::from(required(&req.staging_target_path, "staging target path")?);
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| PluginError::invalid("volume capability is required"))?;
        let parts = self.node_parts()?;

        if let Some(existing) = parts.tracking.load(volume_id).await? {
            if existing.staging_path == staging {
                debug!(volume = %volume_id, "Volume already staged");
                return Ok(v1::NodeStageVolumeResponse {});
            }
        }

        let info = publish_context::decode(&req.publish_context, &self.inner.cipher)?;
        let mut record = TrackingRecord {
            volume_id: volume_id.to_string(),
            staging_path: staging,
            last_observed_protocol: info.protocol,
            publish_info: info,
            raw_block: is_block(capability),
            ..Default::default()
        };

        // File volumes are mounted per target at publish time
        if record.publish_info.protocol == Protocol::Block {
            if let Err(e) = self.stage_block(parts, &req, capability, &mut record).await {
                if let Some(target) = &record.iscsi {
                    if let Err(logout) = parts.host.iscsi_logout(target).await {
                        warn!(volume = %volume_id, error = %logout, "Could not log out after a failed stage");
                    }
                }
                return Err(e);
            }
        }
        parts.tracking.save(&record).await?;

        let update = VolumePublicationUpdate {
            not_safe_to_attach: Some(false),
        };
        if let Err(e) = parts
            .controller
            .update_volume_publication(volume_id, self.node_name(), &update)
            .await
        {
            warn!(volume = %volume_id, error = %e, "Could not clear the publication's unsafe-to-attach flag");
        }

        info!(volume = %volume_id, protocol = %record.publish_info.protocol, "Volume staged");
        Ok(v1::NodeStageVolumeResponse {})
    }

    async fn unstage_op(&self, req: v1::NodeUnstageVolumeRequest) -> PResult<v1::NodeUnstageVolumeResponse> {
        let volume_id = required(&req.volume_id, "volume id")?;
        required(&req.staging_target_path, "staging target path")?;
        let parts = self.node_parts()?;

        let Some(record) = parts.tracking.load(volume_id).await? else {
            debug!(volume = %volume_id, "Volume is not staged");
            return Ok(v1::NodeUnstageVolumeResponse {});
        };

        if record.publish_info.protocol == Protocol::Block {
            if !record.raw_block {
                parts.host.unmount(&record.staging_path).await?;
            }
            if record.luks_device.is_some() {
                parts.host.luks_close(&luks_mapper_name(volume_id)).await?;
            }
            if let Some(target) = &record.iscsi {
                parts.host.iscsi_logout(target).await?;
            }
        }
        parts.tracking.delete(volume_id).await?;

        info!(volume = %volume_id, "Volume unstaged");
        Ok(v1::NodeUnstageVolumeResponse {})
    }

    async fn publish_op(&self, req: v1::NodePublishVolumeRequest) -> PResult<v1::NodePublishVolumeResponse> {
        let volume_id = required(&req.volume_id, "volume id")?;
        let target = PathBuf::from(required(&req.target_path, "target path")?);
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| PluginError::invalid("volume capability is required"))?;
        let parts = self.node_parts()?;

        let mut record = parts.tracking.load(volume_id).await?.ok_or_else(|| {
            OrchestratorError::FailedPrecondition(format!("volume {volume_id} is not staged on this node"))
        })?;

        if record.publish_info.protocol != Protocol::Block {
            let info = &record.publish_info;
            tokio::fs::create_dir_all(&target).await?;
            let mut options = mount_options(&info.mount_options, Some(capability));
            if req.readonly {
                options.push("ro".to_string());
            }
            let source = format!("{}:{}", info.nfs_server, info.nfs_path);
            parts.host.mount(&source, &target, "nfs", &options).await?;
            info!(volume = %volume_id, target = %target.display(), "File volume published");
            return Ok(v1::NodePublishVolumeResponse {});
        }

        if record.publish_info.luks_encryption && req.secrets.contains_key(LUKS_PASSPHRASE) {
            let secrets = LuksSecrets::from_secrets(&req.secrets)?;
            if let Some(device) = record.device_path.clone() {
                let names = parts
                    .luks
                    .ensure_volume_passphrase(volume_id, &device, &secrets, false)
                    .await?;
                if names != record.luks_passphrase_names {
                    record.luks_passphrase_names = names;
                    parts.tracking.save(&record).await?;
                }
            }
        }

        if record.raw_block {
            let source = record
                .luks_device
                .as_ref()
                .or(record.device_path.as_ref())
                .ok_or_else(|| PluginError::Host(format!("no device recorded for {volume_id}")))?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            parts.host.bind_mount(source, &target, req.readonly, true).await?;
        } else {
            tokio::fs::create_dir_all(&target).await?;
            parts
                .host
                .bind_mount(&record.staging_path, &target, req.readonly, false)
                .await?;
        }

        info!(volume = %volume_id, target = %target.display(), "Block volume published");
        Ok(v1::NodePublishVolumeResponse {})
    }

    async fn unpublish_op(&self, req: v1::NodeUnpublishVolumeRequest) -> PResult<v1::NodeUnpublishVolumeResponse> {
        let volume_id = required(&req.volume_id, "volume id")?;
        let target = PathBuf::from(required(&req.target_path, "target path")?);
        let parts = self.node_parts()?;

        parts.host.unmount(&target).await?;
        remove_target(&target).await?;
        info!(volume = %volume_id, target = %target.display(), "Volume unpublished");
        Ok(v1::NodeUnpublishVolumeResponse {})
    }

    async fn volume_stats_op(&self, req: v1::NodeGetVolumeStatsRequest) -> PResult<v1::NodeGetVolumeStatsResponse> {
        let volume_id = required(&req.volume_id, "volume id")?;
        let path = PathBuf::from(required(&req.volume_path, "volume path")?);
        let parts = self.node_parts()?;

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(OrchestratorError::not_found("volume path", path.display().to_string()).into());
        }

        let raw_block = parts
            .tracking
            .load(volume_id)
            .await?
            .is_some_and(|record| record.raw_block);
        let usage = if raw_block {
            Vec::new()
        } else {
            let stats = parts.host.volume_stats(&path).await?;
            vec![
                v1::VolumeUsage {
                    available: stats.available_bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    unit: volume_usage::Unit::Bytes as i32,
                },
                v1::VolumeUsage {
                    available: stats.available_inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    unit: volume_usage::Unit::Inodes as i32,
                },
            ]
        };

        Ok(v1::NodeGetVolumeStatsResponse {
            usage,
            volume_condition: Some(v1::VolumeCondition {
                abnormal: false,
                message: String::new(),
            }),
        })
    }

    async fn node_expand_op(&self, req: v1::NodeExpandVolumeRequest) -> PResult<v1::NodeExpandVolumeResponse> {
        let volume_id = required(&req.volume_id, "volume id")?;
        let volume_path = required(&req.volume_path, "volume path")?;
        let size = requested_size(req.capacity_range.as_ref())?;
        let parts = self.node_parts()?;

        let record = parts
            .tracking
            .load(volume_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("staged volume", volume_id))?;

        // File volumes grow on the backend alone, raw devices have no filesystem
        if record.publish_info.protocol != Protocol::Block || record.raw_block {
            return Ok(v1::NodeExpandVolumeResponse {
                capacity_bytes: bytes_i64(size),
            });
        }

        if let Some(target) = &record.iscsi {
            parts.host.iscsi_rescan(target).await?;
        }
        let device = record
            .luks_device
            .as_ref()
            .or(record.device_path.as_ref())
            .ok_or_else(|| PluginError::Host(format!("no device recorded for {volume_id}")))?;
        let mount_path = if req.staging_target_path.is_empty() {
            Path::new(volume_path)
        } else {
            Path::new(&req.staging_target_path)
        };
        let fs_type = if record.publish_info.fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            record.publish_info.fs_type.as_str()
        };
        parts.host.resize_filesystem(device, mount_path, fs_type).await?;

        info!(volume = %volume_id, size, "Filesystem expanded");
        Ok(v1::NodeExpandVolumeResponse {
            capacity_bytes: bytes_i64(size),
        })
    }
}

#[tonic::async_trait]
impl Node for CsiDriver {
    async fn node_stage_volume(
        &self,
        request: Request<v1::NodeStageVolumeRequest>,
    ) -> Result<Response<v1::NodeStageVolumeResponse>, Status> {
        unary("NodeStageVolume", request, |req| async move {
            let driver = self.clone();
            let key = req.volume_id.clone();
            self.ops()
                .node_stage
                .run("NodeStageVolume", &key, async move { driver.stage_op(req).await.map_err(Status::from) })
                .await
        })
        .await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<v1::NodeUnstageVolumeRequest>,
    ) -> Result<Response<v1::NodeUnstageVolumeResponse>, Status> {
        unary("NodeUnstageVolume", request, |req| async move {
            let driver = self.clone();
            let key = req.volume_id.clone();
            self.ops()
                .node_unstage
                .run("NodeUnstageVolume", &key, async move {
                    driver.unstage_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn node_publish_volume(
        &self,
        request: Request<v1::NodePublishVolumeRequest>,
    ) -> Result<Response<v1::NodePublishVolumeResponse>, Status> {
        unary("NodePublishVolume", request, |req| async move {
            let driver = self.clone();
            let key = format!("{}/{}", req.volume_id, req.target_path);
            self.ops()
                .node_publish
                .run("NodePublishVolume", &key, async move {
                    driver.publish_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<v1::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<v1::NodeUnpublishVolumeResponse>, Status> {
        unary("NodeUnpublishVolume", request, |req| async move {
            let driver = self.clone();
            let key = format!("{}/{}", req.volume_id, req.target_path);
            self.ops()
                .node_unpublish
                .run("NodeUnpublishVolume", &key, async move {
                    driver.unpublish_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<v1::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<v1::NodeGetVolumeStatsResponse>, Status> {
        unary("NodeGetVolumeStats", request, |req| async move {
            self.volume_stats_op(req).await.map_err(Status::from)
        })
        .await
    }

    async fn node_expand_volume(
        &self,
        request: Request<v1::NodeExpandVolumeRequest>,
    ) -> Result<Response<v1::NodeExpandVolumeResponse>, Status> {
        unary("NodeExpandVolume", request, |req| async move {
            let driver = self.clone();
            let key = req.volume_id.clone();
            self.ops()
                .node_expand
                .run("NodeExpandVolume", &key, async move {
                    driver.node_expand_op(req).await.map_err(Status::from)
                })
                .await
        })
        .await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<v1::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<v1::NodeGetCapabilitiesResponse>, Status> {
        unary("NodeGetCapabilities", request, |_| async {
            Ok(v1::NodeGetCapabilitiesResponse {
                capabilities: [
                    rpc::Type::StageUnstageVolume,
                    rpc::Type::GetVolumeStats,
                    rpc::Type::ExpandVolume,
                    rpc::Type::VolumeCondition,
                ]
                .into_iter()
                .map(rpc_capability)
                .collect(),
            })
        })
        .await
    }

    async fn node_get_info(
        &self,
        request: Request<v1::NodeGetInfoRequest>,
    ) -> Result<Response<v1::NodeGetInfoResponse>, Status> {
        unary("NodeGetInfo", request, |_| async {
            let topology = self.topology();
            Ok(v1::NodeGetInfoResponse {
                node_id: self.node_name().to_string(),
                max_volumes_per_node: 0,
                accessible_topology: (!topology.is_empty()).then(|| v1::Topology {
                    segments: topology.into_iter().collect(),
                }),
            })
        })
        .await
    }
}
