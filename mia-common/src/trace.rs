//! Trace context propagation.
//!
//! A trace is three opaque identifiers threaded from the HTTP edge through
//! the job envelope into worker logs. `X-Trace-Id` is 32 lowercase hex
//! characters; span ids are 16.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trace context carried by requests and job envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a fresh trace with a new root span.
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Continue an incoming trace id (e.g. from `X-Trace-Id`) with a new
    /// root span for this process.
    pub fn from_trace_id(trace_id: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
        }
    }

    /// Derive a child context: same trace, new span, current span as parent.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// Generate a 32-hex trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a 16-hex span id.
pub fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Validate an incoming `X-Trace-Id` header value.
pub fn is_valid_trace_id(raw: &str) -> bool {
    raw.len() == 32 && raw.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_valid() {
        let ctx = TraceContext::new_root();
        assert!(is_valid_trace_id(&ctx.trace_id));
        assert_eq!(ctx.span_id.len(), 16);
        assert!(ctx.parent_span_id.is_none());
    }

    #[test]
    fn test_child_keeps_trace_and_links_parent() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    }

    #[test]
    fn test_trace_id_validation() {
        assert!(is_valid_trace_id("0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_trace_id("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_valid_trace_id("short"));
        assert!(!is_valid_trace_id("zzzz456789abcdef0123456789abcdef"));
    }
}
