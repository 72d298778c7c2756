// Credential presence check for tomes with `authentication.required`
//
// Only the presence of the credential header is checked; verifying it is left
// to the deployment (gateway, sidecar, or a stricter middleware).

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tome::tome::AuthKind;
use tracing::{debug, warn};

/// Which credential a tome's routes require
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    pub tome_id: String,
    pub kind: Option<AuthKind>,
}

impl AuthPolicy {
    /// `x-api-key` for api-key, `authorization` for jwt, session or unspecified
    pub fn header(&self) -> &'static str {
        match self.kind {
            Some(AuthKind::ApiKey) => "x-api-key",
            _ => "authorization",
        }
    }

    pub fn is_satisfied(&self, headers: &HeaderMap) -> bool {
        headers
            .get(self.header())
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| !value.trim().is_empty())
    }
}

/// Reject requests without the required credential header (401)
pub async fn require_credentials(
    State(policy): State<Arc<AuthPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    if policy.is_satisfied(request.headers()) {
        debug!(tome = %policy.tome_id, "Credential present");
        return next.run(request).await;
    }

    warn!(tome = %policy.tome_id, header = policy.header(), "Missing credential");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "success": false,
            "error": "Authentication required",
            "tome": policy.tome_id,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_per_kind() {
        let policy = |kind| AuthPolicy {
            tome_id: "t".into(),
            kind,
        };
        assert_eq!(policy(Some(AuthKind::ApiKey)).header(), "x-api-key");
        assert_eq!(policy(Some(AuthKind::Jwt)).header(), "authorization");
        assert_eq!(policy(Some(AuthKind::Session)).header(), "authorization");
        assert_eq!(policy(None).header(), "authorization");
    }

    #[test]
    fn test_blank_credential_is_missing() {
        let policy = AuthPolicy {
            tome_id: "t".into(),
            kind: Some(AuthKind::Jwt),
        };
        let mut headers = HeaderMap::new();
        assert!(!policy.is_satisfied(&headers));
        headers.insert("authorization", "  ".parse().unwrap());
        assert!(!policy.is_satisfied(&headers));
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert!(policy.is_satisfied(&headers));
    }
}
