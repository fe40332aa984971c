//! Per-request context
//!
//! Inbound CSI and REST boundaries run their handler inside
//! [`with_request_context`]. Anything downstream, including the REST client's
//! `X-Request-ID` header, reads the values back from the task.

use std::future::Future;

/// Where a request entered the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    /// CSI gRPC call
    Csi,
    /// Controller REST call
    Rest,
    /// Background task (watchers, self-healing)
    Internal,
}

impl RequestSource {
    /// Tag value used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csi => "csi",
            Self::Rest => "rest",
            Self::Internal => "internal",
        }
    }
}

/// Values carried by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Correlation ID sent as `X-Request-ID`
    pub request_id: String,
    /// Entry point
    pub source: RequestSource,
}

impl RequestContext {
    /// Context with a fresh request ID
    pub fn new(source: RequestSource) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            source,
        }
    }
}

tokio::task_local! {
    static CONTEXT: RequestContext;
}

/// Runs `fut` with `ctx` as the current request context.
pub async fn with_request_context<F: Future>(ctx: RequestContext, fut: F) -> F::Output {
    CONTEXT.scope(ctx, fut).await
}

/// The current request context, if the task runs inside one.
pub fn current_context() -> Option<RequestContext> {
    CONTEXT.try_with(Clone::clone).ok()
}

/// Request ID of the current context, or a fresh one outside any request.
pub fn current_request_id() -> String {
    current_context().map_or_else(|| uuid::Uuid::new_v4().to_string(), |c| c.request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_id_is_visible_inside_scope() {
        let ctx = RequestContext {
            request_id: "req-1".to_string(),
            source: RequestSource::Csi,
        };
        let seen = with_request_context(ctx, async { current_request_id() }).await;
        assert_eq!(seen, "req-1");
        assert!(current_context().is_none());
    }
}
