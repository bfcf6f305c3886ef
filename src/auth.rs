use axum::http::{HeaderMap, header};
use subtle::ConstantTimeEq;

use crate::config::AUTH_DISABLED_SENTINEL;
use crate::error::ServiceError;

/// Bearer-token check against a single shared secret.
#[derive(Clone)]
pub struct AuthGate {
    secret: Option<String>,
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        let secret = (secret != AUTH_DISABLED_SENTINEL).then(|| secret.to_string());
        Self { secret }
    }

    /// With auth disabled every caller is accepted, including ones that send
    /// no credential at all.
    pub fn authenticate(&self, credential: Option<&str>) -> Result<(), ServiceError> {
        let Some(expected) = self.secret.as_deref() else {
            return Ok(());
        };
        let provided = credential.ok_or(ServiceError::Unauthorized)?;
        if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            Err(ServiceError::Unauthorized)
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn exact_secret_required_when_enabled() {
        let gate = AuthGate::new("s3cret");
        assert!(gate.authenticate(Some("s3cret")).is_ok());
        assert!(matches!(
            gate.authenticate(Some("s3cre")),
            Err(ServiceError::Unauthorized)
        ));
        assert!(matches!(
            gate.authenticate(None),
            Err(ServiceError::Unauthorized)
        ));
    }

    #[test]
    fn sentinel_accepts_anything() {
        let gate = AuthGate::new(AUTH_DISABLED_SENTINEL);
        assert!(gate.authenticate(None).is_ok());
        assert!(gate.authenticate(Some("whatever")).is_ok());
    }

    #[test]
    fn only_the_exact_sentinel_disables_auth() {
        let gate = AuthGate::new("changeme ");
        assert!(matches!(
            gate.authenticate(None),
            Err(ServiceError::Unauthorized)
        ));
        assert!(gate.authenticate(Some("changeme ")).is_ok());
    }

    #[test]
    fn extracts_bearer_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
