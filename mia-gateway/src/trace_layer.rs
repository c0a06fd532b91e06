//! `X-Trace-Id` handling at the HTTP edge.
//!
//! A valid incoming trace id (32 lowercase hex) is continued; anything else
//! gets a fresh one. The id is echoed on the response and stashed as a
//! request extension for handlers and job envelopes.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use mia_common::trace::{is_valid_trace_id, TraceContext};

pub const TRACE_HEADER: &str = "x-trace-id";

pub async fn trace_middleware(mut request: Request, next: Next) -> Response {
    let trace = request
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|raw| is_valid_trace_id(raw))
        .map(TraceContext::from_trace_id)
        .unwrap_or_else(TraceContext::new_root);

    let trace_id = trace.trace_id.clone();
    request.extensions_mut().insert(trace);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}
