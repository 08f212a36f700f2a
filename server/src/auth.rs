//! Credential Resolver — turns the handshake's cookie into an
//! authenticated identity, or rejects the connection.
//!
//! Cookie-only: the token must arrive in the configured cookie. Runs
//! once per connection; frames after that trust the bound identity.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use chrono::Utc;
use tracing::{debug, warn};

use crate::error::TrackError;
use crate::state::AppState;
use crate::store::TokenStore;
use crate::types::Identity;

/// Resolve the request headers to an identity via the app state's
/// token store and config.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, TrackError> {
    resolve(
        headers,
        state.tokens.as_ref(),
        &state.config.auth_cookie_name,
        state.config.token_max_age(),
    )
    .await
}

/// Full resolution pipeline: cookie → token lookup → expiry → identity.
/// An expired token is deleted before the rejection so it cannot be
/// replayed.
pub async fn resolve(
    headers: &HeaderMap,
    tokens: &dyn TokenStore,
    cookie_name: &str,
    max_age: chrono::Duration,
) -> Result<Identity, TrackError> {
    let key = cookie_value(headers, cookie_name).ok_or(TrackError::MissingCredential)?;

    let record = tokens
        .lookup_token(&key)
        .await?
        .ok_or(TrackError::InvalidCredential)?;

    if record.created_at < Utc::now() - max_age {
        if let Err(e) = tokens.delete_token(&key).await {
            warn!("expired token delete failed: {e}");
        }
        return Err(TrackError::ExpiredCredential);
    }

    if !record.is_active {
        debug!(user_id = record.user_id, "inactive user rejected");
        return Err(TrackError::InvalidCredential);
    }

    Ok(record.identity())
}

/// Pull a named cookie out of the Cookie header(s).
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                return parts.next().map(str::to_string);
            }
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TokenRecord;
    use crate::types::Role;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemoryTokens {
        tokens: Mutex<HashMap<String, TokenRecord>>,
    }

    impl MemoryTokens {
        fn with(key: &str, record: TokenRecord) -> Self {
            let mut map = HashMap::new();
            map.insert(key.to_string(), record);
            Self {
                tokens: Mutex::new(map),
            }
        }

        fn contains(&self, key: &str) -> bool {
            self.tokens.lock().unwrap().contains_key(key)
        }
    }

    #[async_trait]
    impl TokenStore for MemoryTokens {
        async fn lookup_token(&self, key: &str) -> Result<Option<TokenRecord>, TrackError> {
            Ok(self.tokens.lock().unwrap().get(key).cloned())
        }

        async fn delete_token(&self, key: &str) -> Result<(), TrackError> {
            self.tokens.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn record(age: Duration, is_active: bool) -> TokenRecord {
        TokenRecord {
            user_id: 1,
            username: "A".into(),
            role: Role::Driver,
            is_active,
            created_at: Utc::now() - age,
        }
    }

    fn headers_with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn valid_cookie_resolves_identity() {
        let tokens = MemoryTokens::with("tok1", record(Duration::hours(1), true));
        let headers = headers_with_cookie("buggy_auth=tok1");
        let identity = resolve(&headers, &tokens, "buggy_auth", Duration::days(7))
            .await
            .unwrap();
        assert_eq!(identity.id, 1);
        assert_eq!(identity.username, "A");
        assert_eq!(identity.role, Role::Driver);
    }

    #[tokio::test]
    async fn cookie_is_found_among_others() {
        let tokens = MemoryTokens::with("tok1", record(Duration::hours(1), true));
        let headers = headers_with_cookie("theme=dark; buggy_auth=tok1; lang=en");
        assert!(resolve(&headers, &tokens, "buggy_auth", Duration::days(7))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn missing_cookie_is_rejected() {
        let tokens = MemoryTokens::with("tok1", record(Duration::hours(1), true));
        let headers = HeaderMap::new();
        let err = resolve(&headers, &tokens, "buggy_auth", Duration::days(7))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::MissingCredential));
    }

    #[tokio::test]
    async fn query_parameter_token_is_not_accepted() {
        // Only the cookie path exists; a token anywhere else is a
        // missing credential.
        let tokens = MemoryTokens::with("tok1", record(Duration::hours(1), true));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Token tok1".parse().unwrap());
        let err = resolve(&headers, &tokens, "buggy_auth", Duration::days(7))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::MissingCredential));
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let tokens = MemoryTokens::with("tok1", record(Duration::hours(1), true));
        let headers = headers_with_cookie("buggy_auth=bogus");
        let err = resolve(&headers, &tokens, "buggy_auth", Duration::days(7))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::InvalidCredential));
    }

    #[tokio::test]
    async fn expired_token_is_deleted_then_rejected() {
        let tokens = MemoryTokens::with("tok1", record(Duration::days(8), true));
        let headers = headers_with_cookie("buggy_auth=tok1");
        let err = resolve(&headers, &tokens, "buggy_auth", Duration::days(7))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::ExpiredCredential));
        assert!(!tokens.contains("tok1"));
    }

    #[tokio::test]
    async fn inactive_user_is_rejected() {
        let tokens = MemoryTokens::with("tok1", record(Duration::hours(1), false));
        let headers = headers_with_cookie("buggy_auth=tok1");
        let err = resolve(&headers, &tokens, "buggy_auth", Duration::days(7))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::InvalidCredential));
    }
}
