//! Per-request context and audit logging

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use storage_core::{RequestContext, RequestSource, with_request_context};
use tracing::{Instrument, info, info_span};

/// Header carrying the request correlation ID.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Attach a request context to every REST call and audit it.
///
/// The correlation ID comes from the caller's `X-Request-ID` header when
/// present so node and controller log lines line up. Bodies are never
/// logged here.
pub async fn request_context(request: Request, next: Next) -> Response {
    let mut ctx = RequestContext::new(RequestSource::Rest);
    if let Some(id) = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        ctx.request_id = id.to_string();
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = info_span!(
        "rest",
        request_id = %ctx.request_id,
        source = ctx.source.as_str(),
        method = %method,
        path = %path,
    );

    let started = Instant::now();
    let response = with_request_context(ctx, next.run(request)).instrument(span.clone()).await;

    span.in_scope(|| {
        info!(
            target: "audit",
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "REST request"
        );
    });
    response
}
