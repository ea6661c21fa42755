use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use taskline_core::OperationRequest;
use taskline_types::{ResponseMode, SessionId};
use utoipa::ToSchema;

/// Body of `POST /v1/operations`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateOperationRequest {
    /// Registered operation name, e.g. `demo/echo`.
    pub method: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: Value,
    /// Requested TTL in milliseconds; clamped by the runtime.
    pub ttl: Option<u64>,
    /// Milliseconds.
    pub poll_interval: Option<u64>,
    /// In order of preference. Empty means `task`.
    #[serde(default)]
    pub response_modes: Vec<ResponseMode>,
}

impl CreateOperationRequest {
    pub fn into_request(self, session: SessionId) -> OperationRequest {
        let mut request = OperationRequest::new(self.method, self.params)
            .with_modes(self.response_modes)
            .in_session(session);
        if let Some(ttl) = self.ttl {
            request = request.with_ttl(Duration::from_millis(ttl));
        }
        if let Some(interval) = self.poll_interval {
            request = request.with_poll_interval(Duration::from_millis(interval));
        }
        request
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_defaults_to_task_mode_and_null_params() {
        let body: CreateOperationRequest =
            serde_json::from_value(json!({ "method": "demo/echo" })).unwrap();
        assert!(body.params.is_null());
        assert!(body.response_modes.is_empty());

        let request = body.into_request(SessionId::new("s"));
        assert_eq!(request.method, "demo/echo");
        assert_eq!(request.session, SessionId::new("s"));
        assert_eq!(request.ttl, None);
    }

    #[test]
    fn ttl_and_modes_are_carried_over() {
        let body: CreateOperationRequest = serde_json::from_value(json!({
            "method": "demo/echo",
            "ttl": 1500,
            "responseModes": ["stream", "inline"],
        }))
        .unwrap();
        let request = body.into_request(SessionId::default());
        assert_eq!(request.ttl, Some(Duration::from_millis(1500)));
        assert_eq!(
            request.response_modes,
            vec![ResponseMode::Stream, ResponseMode::Inline]
        );
    }
}
