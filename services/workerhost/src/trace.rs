//! Explicit trace context, passed through every invocation.
//!
//! Some host implementations rely on an ambient "activity" carrying baggage;
//! here it is a plain value threaded through `SendInvocation` — nothing is
//! read from thread-local or task-local state.

/// Correlation attributes attached to an invocation when the host's
/// telemetry agent is enabled (`APPLICATIONINSIGHTS_ENABLE_AGENT`).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TraceContext {
    pub process_id: Option<String>,
    pub host_instance_id: Option<String>,
    pub category_name: Option<String>,
    pub live_logs_session_id: Option<String>,
}

impl TraceContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(
        process_id: impl Into<String>,
        host_instance_id: impl Into<String>,
        category_name: impl Into<String>,
    ) -> Self {
        Self {
            process_id: Some(process_id.into()),
            host_instance_id: Some(host_instance_id.into()),
            category_name: Some(category_name.into()),
            live_logs_session_id: None,
        }
    }

    pub fn with_live_logs_session(mut self, id: impl Into<String>) -> Self {
        self.live_logs_session_id = Some(id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.process_id.is_none()
            && self.host_instance_id.is_none()
            && self.category_name.is_none()
            && self.live_logs_session_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_when_telemetry_disabled() {
        assert!(TraceContext::empty().is_empty());
    }

    #[test]
    fn carries_baggage_explicitly() {
        let ctx = TraceContext::new("pid-1", "host-1", "Function")
            .with_live_logs_session("session-1");
        assert_eq!(ctx.process_id.as_deref(), Some("pid-1"));
        assert_eq!(ctx.live_logs_session_id.as_deref(), Some("session-1"));
    }
}
