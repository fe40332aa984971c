//! Container Storage Interface v1 bindings
//!
//! Generated at build time from `proto/csi.proto` (the Identity, Controller
//! and Node services this driver implements).

/// CSI protobuf packages
pub mod csi {
    /// `csi.v1`
    #[rustfmt::skip]
    #[allow(missing_docs, missing_debug_implementations, clippy::all, clippy::pedantic)]
    pub mod v1 {
        tonic::include_proto!("csi.v1");
    }
}

pub use csi::v1;
