//! Storage pool attributes and the storage class requests matched against them.
//!
//! Each attribute has a declared kind. Storage class parameters arrive as
//! strings and are converted to a typed [`AttributeRequest`] based on that kind.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute names understood by the catalog.
pub const BACKEND_TYPE: &str = "backendType";
/// Media type offered by a pool ("hdd", "ssd", "hybrid").
pub const MEDIA: &str = "media";
/// Thin or thick provisioning.
pub const PROVISIONING_TYPE: &str = "provisioningType";
/// Snapshot support.
pub const SNAPSHOTS: &str = "snapshots";
/// Clone support.
pub const CLONES: &str = "clones";
/// Encryption at rest.
pub const ENCRYPTION: &str = "encryption";
/// Provisioned IOPS.
pub const IOPS: &str = "IOPS";
/// Replication support.
pub const REPLICATION: &str = "replication";
/// Arbitrary pool labels.
pub const LABELS: &str = "labels";

/// Declared kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeKind {
    /// `true` / `false`
    Bool,
    /// Signed integer
    Int,
    /// Free-form string
    String,
    /// Label selector (`key=value,key2=value2`)
    Labels,
}

/// Returns the declared kind of a known attribute.
pub fn attribute_kind(name: &str) -> Option<AttributeKind> {
    match name {
        BACKEND_TYPE | MEDIA | PROVISIONING_TYPE => Some(AttributeKind::String),
        SNAPSHOTS | CLONES | ENCRYPTION | REPLICATION => Some(AttributeKind::Bool),
        IOPS => Some(AttributeKind::Int),
        LABELS => Some(AttributeKind::Labels),
        _ => None,
    }
}

/// What a storage pool offers for one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "offer", rename_all = "camelCase")]
pub enum AttributeValue {
    /// Boolean capability
    Bool(bool),
    /// Inclusive integer range
    IntRange {
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
    /// Any of these string values
    Strings(Vec<String>),
    /// Labels attached to the pool
    Labels(BTreeMap<String, String>),
}

/// What a storage class requests for one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum AttributeRequest {
    /// Boolean requirement
    Bool(bool),
    /// Integer requirement
    Int(i64),
    /// String requirement
    String(String),
    /// Label selector
    Labels(String),
}

impl AttributeRequest {
    /// Converts a storage class parameter into a typed request.
    ///
    /// Unknown attribute names are rejected so typos in a storage class surface
    /// at admission rather than as an empty pool match.
    pub fn from_parameter(name: &str, value: &str) -> Result<Self> {
        let kind = attribute_kind(name)
            .ok_or_else(|| OrchestratorError::invalid(format!("unrecognized storage attribute: {name}")))?;
        let value = value.trim();

        match kind {
            AttributeKind::Bool => value
                .parse::<bool>()
                .map(Self::Bool)
                .map_err(|e| OrchestratorError::invalid(format!("attribute {name}: {value} is not a boolean: {e}"))),
            AttributeKind::Int => value
                .parse::<i64>()
                .map(Self::Int)
                .map_err(|e| OrchestratorError::invalid(format!("attribute {name}: {value} is not an integer: {e}"))),
            AttributeKind::String => Ok(Self::String(value.to_string())),
            AttributeKind::Labels => {
                parse_label_selector(value)?;
                Ok(Self::Labels(value.to_string()))
            }
        }
    }
}

impl AttributeValue {
    /// True when this offer satisfies the request.
    pub fn satisfies(&self, request: &AttributeRequest) -> bool {
        match (self, request) {
            (Self::Bool(offer), AttributeRequest::Bool(wanted)) => !wanted || *offer,
            (Self::IntRange { min, max }, AttributeRequest::Int(wanted)) => (*min..=*max).contains(wanted),
            (Self::Strings(offers), AttributeRequest::String(wanted)) => offers.iter().any(|o| o == wanted),
            (Self::Labels(labels), AttributeRequest::Labels(selector)) => parse_label_selector(selector)
                .map(|wanted| wanted.iter().all(|(k, v)| labels.get(k) == Some(v)))
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn parse_label_selector(selector: &str) -> Result<BTreeMap<String, String>> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| OrchestratorError::invalid(format!("label selector term '{pair}' is not key=value")))
        })
        .collect()
}
