//! Connect-time session verification.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;

use crate::error::GatewayError;
use crate::store::{AuthProvider, Identity};

/// Extract the value of `cookie_name` from the request's `Cookie` headers.
/// Empty values are treated as absent.
pub fn session_credential<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

/// Resolve a credential to an identity, rejecting missing credentials,
/// unknown sessions and suspended accounts.
pub async fn verify_session(
    auth: &dyn AuthProvider,
    credential: Option<&str>,
) -> Result<Identity, GatewayError> {
    let credential = credential.ok_or(GatewayError::Unauthenticated)?;

    let identity = auth
        .resolve_session(credential)
        .await?
        .ok_or(GatewayError::InvalidSession)?;

    if identity.suspended {
        tracing::info!(user_id = %identity.user_id, "rejected connection from suspended account");
        return Err(GatewayError::AccountSuspended);
    }

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use axum::http::HeaderValue;

    fn headers(cookie: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        map
    }

    #[test]
    fn finds_named_cookie_among_others() {
        let h = headers("theme=dark; drape_session=abc123; lang=en");
        assert_eq!(session_credential(&h, "drape_session"), Some("abc123"));
    }

    #[test]
    fn missing_or_empty_cookie_is_none() {
        assert_eq!(session_credential(&HeaderMap::new(), "drape_session"), None);
        assert_eq!(session_credential(&headers("theme=dark"), "drape_session"), None);
        assert_eq!(session_credential(&headers("drape_session="), "drape_session"), None);
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_user("u1", "alice");
        store.add_session("good", "u1");
        store.add_user("u2", "mallory");
        store.add_session("banned", "u2");
        store.suspend_user("u2");
        store
    }

    #[tokio::test]
    async fn no_credential_is_unauthenticated() {
        let err = verify_session(&store(), None).await.unwrap_err();
        assert_eq!(err, GatewayError::Unauthenticated);
    }

    #[tokio::test]
    async fn unknown_credential_is_invalid_session() {
        let err = verify_session(&store(), Some("nope")).await.unwrap_err();
        assert_eq!(err, GatewayError::InvalidSession);
    }

    #[tokio::test]
    async fn suspended_account_is_rejected() {
        let err = verify_session(&store(), Some("banned")).await.unwrap_err();
        assert_eq!(err, GatewayError::AccountSuspended);
    }

    #[tokio::test]
    async fn valid_session_resolves_identity() {
        let identity = verify_session(&store(), Some("good")).await.unwrap();
        assert_eq!(identity.user_id, "u1");
    }

    #[tokio::test]
    async fn auth_outage_is_a_persistence_failure() {
        let store = store();
        store.set_unavailable(true);
        let err = verify_session(&store, Some("good")).await.unwrap_err();
        assert_eq!(err.code(), "PERSISTENCE_FAILURE");
    }
}
