//! Trident CRD Definitions
//!
//! Custom resources the CSI controller watches alongside the core
//! Kubernetes storage objects.

pub mod error;
pub mod mirror_relationship;
pub mod volume_reference;

pub use error::CrdError;
pub use mirror_relationship::*;
pub use volume_reference::*;
