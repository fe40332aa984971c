//! Unary call wrapper for the CSI services.
//!
//! tonic interceptors cannot see the response, so every service method runs
//! its body through [`unary`]. It gives the call a fresh request context
//! tagged `csi`, a tracing span, an audit entry, and debug logging of the
//! request and response with secrets removed.

use csi_proto::v1;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Instant;
use storage_core::{RequestContext, RequestSource, with_request_context};
use tonic::{Request, Response, Status};
use tracing::{Instrument, debug, error, info, info_span};

use crate::crypto::CHAP_FIELDS;

const REDACTED: &str = "<REDACTED>";

/// A message the CSI services log.
///
/// Types carrying secrets override [`Redact::redacted`] to blank them on a
/// copy before formatting; everything else prints its `Debug` output.
pub trait Redact: Debug {
    fn redacted(&self) -> String {
        format!("{self:?}")
    }
}

/// Every value of a CSI secrets map
fn scrub_secrets(secrets: &mut HashMap<String, String>) {
    for value in secrets.values_mut() {
        REDACTED.clone_into(value);
    }
}

/// CHAP entries of a publish context
fn scrub_chap(context: &mut HashMap<String, String>) {
    for key in CHAP_FIELDS {
        if let Some(value) = context.get_mut(key) {
            REDACTED.clone_into(value);
        }
    }
}

macro_rules! redact_as_debug {
    ($($message:ty),* $(,)?) => {
        $(impl Redact for $message {})*
    };
}

macro_rules! redact_fields {
    ($($message:ty => [$($scrub:ident($field:ident)),+]),* $(,)?) => {
        $(impl Redact for $message {
            fn redacted(&self) -> String {
                let mut copy = self.clone();
                $($scrub(&mut copy.$field);)+
                format!("{copy:?}")
            }
        })*
    };
}

redact_fields! {
    v1::CreateVolumeRequest => [scrub_secrets(secrets)],
    v1::DeleteVolumeRequest => [scrub_secrets(secrets)],
    v1::ControllerPublishVolumeRequest => [scrub_secrets(secrets)],
    v1::ControllerPublishVolumeResponse => [scrub_chap(publish_context)],
    v1::ControllerUnpublishVolumeRequest => [scrub_secrets(secrets)],
    v1::ValidateVolumeCapabilitiesRequest => [scrub_secrets(secrets)],
    v1::CreateSnapshotRequest => [scrub_secrets(secrets)],
    v1::DeleteSnapshotRequest => [scrub_secrets(secrets)],
    v1::ListSnapshotsRequest => [scrub_secrets(secrets)],
    v1::ControllerExpandVolumeRequest => [scrub_secrets(secrets)],
    v1::NodeStageVolumeRequest => [scrub_secrets(secrets), scrub_chap(publish_context)],
    v1::NodePublishVolumeRequest => [scrub_secrets(secrets), scrub_chap(publish_context)],
    v1::NodeExpandVolumeRequest => [scrub_secrets(secrets)],
}

redact_as_debug! {
    (),
    v1::GetPluginInfoRequest,
    v1::GetPluginInfoResponse,
    v1::GetPluginCapabilitiesRequest,
    v1::GetPluginCapabilitiesResponse,
    v1::ProbeRequest,
    v1::ProbeResponse,
    v1::CreateVolumeResponse,
    v1::DeleteVolumeResponse,
    v1::ControllerUnpublishVolumeResponse,
    v1::ValidateVolumeCapabilitiesResponse,
    v1::ListVolumesRequest,
    v1::ListVolumesResponse,
    v1::GetCapacityRequest,
    v1::GetCapacityResponse,
    v1::ControllerGetCapabilitiesRequest,
    v1::ControllerGetCapabilitiesResponse,
    v1::CreateSnapshotResponse,
    v1::DeleteSnapshotResponse,
    v1::ListSnapshotsResponse,
    v1::ControllerExpandVolumeResponse,
    v1::ControllerGetVolumeRequest,
    v1::ControllerGetVolumeResponse,
    v1::NodeStageVolumeResponse,
    v1::NodeUnstageVolumeRequest,
    v1::NodeUnstageVolumeResponse,
    v1::NodePublishVolumeResponse,
    v1::NodeUnpublishVolumeRequest,
    v1::NodeUnpublishVolumeResponse,
    v1::NodeGetVolumeStatsRequest,
    v1::NodeGetVolumeStatsResponse,
    v1::NodeExpandVolumeResponse,
    v1::NodeGetCapabilitiesRequest,
    v1::NodeGetCapabilitiesResponse,
    v1::NodeGetInfoRequest,
    v1::NodeGetInfoResponse,
}

/// Run one CSI method body inside a request context.
pub async fn unary<Req, Resp, F, Fut>(method: &'static str, request: Request<Req>, handler: F) -> Result<Response<Resp>, Status>
where
    Req: Redact,
    Resp: Redact,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Result<Resp, Status>>,
{
    let ctx = RequestContext::new(RequestSource::Csi);
    let span = info_span!("csi", request_id = %ctx.request_id, source = ctx.source.as_str(), method);
    let request = request.into_inner();

    async move {
        debug!(request = %request.redacted(), "GRPC call");
        let started = Instant::now();
        let outcome = with_request_context(ctx, handler(request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(response) => {
                debug!(response = %response.redacted(), "GRPC response");
                info!(target: "audit", elapsed_ms, "CSI call");
            }
            Err(status) => {
                error!(code = ?status.code(), error = %status.message(), "GRPC error");
                info!(target: "audit", elapsed_ms, code = ?status.code(), "CSI call failed");
            }
        }
        outcome.map(Response::new)
    }
    .instrument(span)
    .await
}
