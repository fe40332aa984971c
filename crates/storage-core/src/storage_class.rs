//! Storage class parameter conversion.
//!
//! Kubernetes storage classes and bare CSI `CreateVolume` calls both carry a
//! flat string map. This module turns that map into a [`StorageClassConfig`].

use crate::attributes::AttributeRequest;
use crate::error::Result;
use crate::model::StorageClassConfig;
use crate::pools::{PoolMap, parse_pool_map};
use std::collections::BTreeMap;

/// Prefix of parameters consumed by the external provisioner sidecar.
pub const CSI_PARAMETER_PREFIX: &str = "csi.storage.k8s.io/";
/// Filesystem type parameter.
pub const FS_TYPE_PARAMETER: &str = "fsType";
/// Pools that are the only eligible targets.
pub const STORAGE_POOLS: &str = "storagePools";
/// Legacy name of [`ADDITIONAL_STORAGE_POOLS`].
pub const REQUIRED_STORAGE: &str = "requiredStorage";
/// Pools added regardless of attributes.
pub const ADDITIONAL_STORAGE_POOLS: &str = "additionalStoragePools";
/// Pools never eligible.
pub const EXCLUDE_STORAGE_POOLS: &str = "excludeStoragePools";

/// Builds a storage class config from its parameter map.
///
/// CSI sidecar keys and `fsType` are skipped. The pool keys are parsed with
/// the pool-map grammar and everything else becomes an attribute request.
pub fn storage_class_config_from_parameters(
    name: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<StorageClassConfig> {
    let mut config = StorageClassConfig {
        name: name.to_string(),
        ..Default::default()
    };

    for (key, value) in parameters {
        if key.starts_with(CSI_PARAMETER_PREFIX) || key.eq_ignore_ascii_case(FS_TYPE_PARAMETER) {
            continue;
        }

        match key.as_str() {
            STORAGE_POOLS => merge(&mut config.pools, parse_pool_map(value)?),
            REQUIRED_STORAGE | ADDITIONAL_STORAGE_POOLS => {
                merge(&mut config.additional_pools, parse_pool_map(value)?);
            }
            EXCLUDE_STORAGE_POOLS => merge(&mut config.excluded_pools, parse_pool_map(value)?),
            _ => {
                config
                    .attributes
                    .insert(key.clone(), AttributeRequest::from_parameter(key, value)?);
            }
        }
    }

    Ok(config)
}

fn merge(into: &mut PoolMap, from: PoolMap) {
    for (backend, pools) in from {
        into.entry(backend).or_default().extend(pools);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{MEDIA, SNAPSHOTS};

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn splits_pools_attributes_and_skipped_keys() {
        let config = storage_class_config_from_parameters(
            "gold",
            &params(&[
                ("csi.storage.k8s.io/provisioner-secret-name", "x"),
                ("fsType", "xfs"),
                (MEDIA, "ssd"),
                (SNAPSHOTS, "true"),
                (STORAGE_POOLS, "b1:p1,p2"),
                (REQUIRED_STORAGE, "b2:p1"),
                (ADDITIONAL_STORAGE_POOLS, "b2:p2"),
                (EXCLUDE_STORAGE_POOLS, "b1:p2"),
            ]),
        )
        .expect("parameters should convert");

        assert_eq!(config.name, "gold");
        assert_eq!(config.attributes.len(), 2);
        assert_eq!(config.attributes[SNAPSHOTS], AttributeRequest::Bool(true));
        assert_eq!(config.pools["b1"].len(), 2);
        assert_eq!(config.additional_pools["b2"].len(), 2);
        assert!(config.excluded_pools["b1"].contains("p2"));
    }

    #[test]
    fn every_pool_key_decodes_to_backend_pool_pairs() {
        let config = storage_class_config_from_parameters(
            "sc",
            &params(&[(STORAGE_POOLS, " b1 : p1 ; b2:p3,p4 ")]),
        )
        .expect("parameters should convert");
        for (backend, pools) in &config.pools {
            assert!(!backend.is_empty());
            assert!(pools.iter().all(|p| !p.is_empty()));
        }
    }

    #[test]
    fn malformed_pool_value_is_rejected() {
        assert!(storage_class_config_from_parameters("sc", &params(&[(STORAGE_POOLS, "b1")])).is_err());
    }
}
