//! Node-side services: host access, staging records, LUKS passphrases,
//! registration and iSCSI self-healing.

pub mod host;
pub mod luks;
pub mod registration;
pub mod self_heal;
pub mod tracking;

pub use host::{ExecHostAgent, HostAgent, IscsiTarget, luks_mapper_name};
pub use luks::{LuksPassphraseManager, LuksSecrets};
pub use registration::{describe_node, register_node};
pub use self_heal::SelfHealer;
pub use tracking::{TrackingRecord, TrackingStore};
