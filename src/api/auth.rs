//! Authentication and quota admission.
//!
//! Both ingress surfaces accept either `x-api-key` (Anthropic style) or
//! `Authorization: Bearer` (OpenAI style). The check is synchronous against
//! the current config snapshot and completes before any request body bytes
//! are read.

use axum::http::HeaderMap;

use crate::core::config::{ConfigSnapshot, Principal};
use crate::core::error::{GatewayError, Result};

/// Extract the presented credential, `x-api-key` taking priority.
fn extract_credential<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
}

/// Admit the request and return the owning principal.
///
/// Missing or unknown credential fails with 401; a known user-role principal
/// past its quota fails with 403 before the router ever runs.
pub fn authenticate(headers: &HeaderMap, snapshot: &ConfigSnapshot) -> Result<Principal> {
    let key = extract_credential(headers).ok_or(GatewayError::Unauthenticated)?;

    let credential = snapshot
        .find_credential(key)
        .ok_or(GatewayError::Unauthenticated)?;

    if credential.principal.quota_exhausted() {
        return Err(GatewayError::QuotaExhausted);
    }

    tracing::debug!(principal_id = credential.principal.id, "Authenticated");
    Ok(credential.principal.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Credential, Role};

    fn snapshot_with(quota: f64, used: f64, role: Role) -> ConfigSnapshot {
        ConfigSnapshot::new(
            vec![],
            vec![Credential {
                key: "sk-test".into(),
                active: true,
                principal: Principal {
                    id: 9,
                    role,
                    quota,
                    used_amount: used,
                },
            }],
        )
    }

    fn bearer(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {}", key).parse().unwrap());
        headers
    }

    #[test]
    fn test_bearer_auth_succeeds() {
        let snapshot = snapshot_with(-1.0, 0.0, Role::User);
        let principal = authenticate(&bearer("sk-test"), &snapshot).unwrap();
        assert_eq!(principal.id, 9);
    }

    #[test]
    fn test_x_api_key_auth_succeeds() {
        let snapshot = snapshot_with(-1.0, 0.0, Role::User);
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-test".parse().unwrap());
        assert!(authenticate(&headers, &snapshot).is_ok());
    }

    #[test]
    fn test_x_api_key_takes_priority() {
        let snapshot = snapshot_with(-1.0, 0.0, Role::User);
        let mut headers = bearer("sk-wrong");
        headers.insert("x-api-key", "sk-test".parse().unwrap());
        assert!(authenticate(&headers, &snapshot).is_ok());
    }

    #[test]
    fn test_missing_credential_is_unauthenticated() {
        let snapshot = snapshot_with(-1.0, 0.0, Role::User);
        let err = authenticate(&HeaderMap::new(), &snapshot).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[test]
    fn test_unknown_credential_is_unauthenticated() {
        let snapshot = snapshot_with(-1.0, 0.0, Role::User);
        let err = authenticate(&bearer("sk-other"), &snapshot).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[test]
    fn test_exhausted_quota_is_rejected() {
        let snapshot = snapshot_with(10.0, 10.0, Role::User);
        let err = authenticate(&bearer("sk-test"), &snapshot).unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExhausted));
    }

    #[test]
    fn test_negative_quota_is_unlimited() {
        let snapshot = snapshot_with(-1.0, 1e9, Role::User);
        assert!(authenticate(&bearer("sk-test"), &snapshot).is_ok());
    }

    #[test]
    fn test_admin_bypasses_quota() {
        let snapshot = snapshot_with(0.0, 100.0, Role::Admin);
        assert!(authenticate(&bearer("sk-test"), &snapshot).is_ok());
    }
}
