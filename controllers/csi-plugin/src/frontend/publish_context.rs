//! Publish context carried from ControllerPublishVolume to the node.
//!
//! The CO hands the map back verbatim on NodeStage and NodePublish, so it is
//! the only channel between the two halves. CHAP fields go through
//! [`ChapCipher`].

use std::collections::HashMap;
use storage_core::{Protocol, VolumePublishInfo};

use crate::crypto::ChapCipher;
use crate::error::PluginError;

pub const PROTOCOL: &str = "protocol";
pub const FILESYSTEM: &str = "filesystem";
pub const LUKS_ENCRYPTION: &str = "LUKSEncryption";
pub const ISCSI_TARGET_IQN: &str = "iscsiTargetIqn";
pub const ISCSI_TARGET_PORTAL: &str = "iscsiTargetPortal";
pub const ISCSI_PORTALS: &str = "iscsiPortals";
pub const ISCSI_LUN: &str = "iscsiLunNumber";
pub const NFS_SERVER: &str = "nfsServerIp";
pub const NFS_PATH: &str = "nfsPath";
pub const MOUNT_OPTIONS: &str = "mountOptions";

fn parse_protocol(value: &str) -> Result<Protocol, PluginError> {
    match value {
        "file" => Ok(Protocol::File),
        "block" => Ok(Protocol::Block),
        "blockOnFile" => Ok(Protocol::BlockOnFile),
        "any" | "" => Ok(Protocol::Any),
        other => Err(PluginError::invalid(format!("unknown protocol '{other}' in publish context"))),
    }
}

/// Flatten publish info into the CSI publish context
pub fn encode(info: &VolumePublishInfo, cipher: &ChapCipher) -> Result<HashMap<String, String>, PluginError> {
    let mut context = HashMap::from([
        (PROTOCOL.to_string(), info.protocol.to_string()),
        (LUKS_ENCRYPTION.to_string(), info.luks_encryption.to_string()),
    ]);
    let mut put = |key: &str, value: &str| {
        if !value.is_empty() {
            context.insert(key.to_string(), value.to_string());
        }
    };

    put(FILESYSTEM, &info.fs_type);
    put(MOUNT_OPTIONS, &info.mount_options);
    match info.protocol {
        Protocol::Block => {
            put(ISCSI_TARGET_IQN, &info.iscsi_target_iqn);
            put(ISCSI_TARGET_PORTAL, &info.iscsi_target_portal);
            put(ISCSI_PORTALS, &info.iscsi_portals.join(","));
            put(ISCSI_LUN, &info.iscsi_lun.to_string());
        }
        _ => {
            put(NFS_SERVER, &info.nfs_server);
            put(NFS_PATH, &info.nfs_path);
        }
    }

    if let Some(chap) = &info.chap {
        cipher.encode(chap, &mut context)?;
    }
    Ok(context)
}

/// Rebuild publish info on the node
pub fn decode(context: &HashMap<String, String>, cipher: &ChapCipher) -> Result<VolumePublishInfo, PluginError> {
    let get = |key: &str| context.get(key).cloned().unwrap_or_default();

    let iscsi_lun = match context.get(ISCSI_LUN) {
        Some(lun) => lun
            .parse()
            .map_err(|e| PluginError::invalid(format!("invalid {ISCSI_LUN} '{lun}': {e}")))?,
        None => 0,
    };
    let iscsi_portals = get(ISCSI_PORTALS)
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();

    Ok(VolumePublishInfo {
        protocol: parse_protocol(&get(PROTOCOL))?,
        fs_type: get(FILESYSTEM),
        luks_encryption: get(LUKS_ENCRYPTION).eq_ignore_ascii_case("true"),
        iscsi_target_iqn: get(ISCSI_TARGET_IQN),
        iscsi_target_portal: get(ISCSI_TARGET_PORTAL),
        iscsi_portals,
        iscsi_lun,
        chap: cipher.decode(context)?,
        nfs_server: get(NFS_SERVER),
        nfs_path: get(NFS_PATH),
        mount_options: get(MOUNT_OPTIONS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ENCRYPTED_INITIATOR_SECRET, INITIATOR_SECRET};
    use storage_core::ChapCredentials;

    fn block_info() -> VolumePublishInfo {
        VolumePublishInfo {
            protocol: Protocol::Block,
            fs_type: "xfs".into(),
            luks_encryption: true,
            iscsi_target_iqn: "iqn.1992-08.com.netapp:sn.1".into(),
            iscsi_target_portal: "10.0.0.1:3260".into(),
            iscsi_portals: vec!["10.0.0.2:3260".into()],
            iscsi_lun: 3,
            chap: Some(ChapCredentials {
                initiator_user: "user".into(),
                initiator_secret: "s3cret".into(),
                target_user: "target".into(),
                target_secret: "t0p".into(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_block_info_survives_the_trip_with_encrypted_chap() {
        let cipher = ChapCipher::from_key(&[7u8; 32]).expect("key");
        let context = encode(&block_info(), &cipher).expect("encode");

        assert!(context.contains_key(ENCRYPTED_INITIATOR_SECRET));
        assert!(!context.contains_key(INITIATOR_SECRET));
        assert!(context.values().all(|v| v != "s3cret"));

        assert_eq!(decode(&context, &cipher).expect("decode"), block_info());
    }

    #[test]
    fn test_file_info_omits_iscsi_keys() {
        let info = VolumePublishInfo {
            protocol: Protocol::File,
            nfs_server: "10.0.0.5".into(),
            nfs_path: "/vol1".into(),
            ..Default::default()
        };
        let context = encode(&info, &ChapCipher::cleartext()).expect("encode");
        assert_eq!(context.get(PROTOCOL).map(String::as_str), Some("file"));
        assert!(!context.contains_key(ISCSI_LUN));
        assert_eq!(decode(&context, &ChapCipher::cleartext()).expect("decode"), info);
    }

    #[test]
    fn test_bad_lun_is_rejected() {
        let context = HashMap::from([
            (PROTOCOL.to_string(), "block".to_string()),
            (ISCSI_LUN.to_string(), "first".to_string()),
        ]);
        let err = decode(&context, &ChapCipher::cleartext()).expect_err("bad lun");
        assert!(err.to_string().contains(ISCSI_LUN));
    }
}
