//! Authorization middleware for the in-pod daemon: verifies the bearer
//! token and requires the `x-agentland-session` header to exactly equal
//! the token's `sid` claim (§4.2).

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};

use super::{Claims, CredentialService};

const SESSION_HEADER: &str = "x-agentland-session";

/// Provides the credential service a given Axum state type is built from.
pub trait CredentialState {
    fn credential_service(&self) -> &CredentialService;
}

/// Verified claims attached to the request context once extraction succeeds.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub claims: Claims,
}

#[derive(Debug)]
pub enum MiddlewareRejection {
    /// Token missing, malformed, or failed verification.
    Unauthorized,
    /// Token verified but `x-agentland-session` doesn't match its `sid`.
    Forbidden,
}

impl IntoResponse for MiddlewareRejection {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        };
        status.into_response()
    }
}

impl<S> FromRequestParts<S> for VerifiedSession
where
    S: CredentialState + Send + Sync,
{
    type Rejection = MiddlewareRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(parts).ok_or(MiddlewareRejection::Unauthorized)?;
        let claims = state
            .credential_service()
            .verify(&token)
            .map_err(|_| MiddlewareRejection::Unauthorized)?;

        let header_sid = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(MiddlewareRejection::Forbidden)?;

        if header_sid != claims.sid {
            return Err(MiddlewareRejection::Forbidden);
        }

        Ok(Self { claims })
    }
}

fn extract_bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;
    use std::time::Duration;

    struct TestState(CredentialService);

    impl CredentialState for TestState {
        fn credential_service(&self) -> &CredentialService {
            &self.0
        }
    }

    fn test_state() -> TestState {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = private.to_public_key();
        let private_pem = private
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = public.to_public_key_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        TestState(
            CredentialService::from_pem(
                private_pem.as_bytes(),
                public_pem.as_bytes(),
                "agentland-gateway",
                "agentland-sandbox",
                "agentland-1",
                Duration::from_secs(300),
                Duration::from_secs(30),
            )
            .unwrap(),
        )
    }

    async fn extract(
        state: &TestState,
        token: Option<&str>,
        session_header: Option<&str>,
    ) -> Result<VerifiedSession, MiddlewareRejection> {
        let mut builder = Request::builder().uri("/");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(sid) = session_header {
            builder = builder.header(SESSION_HEADER, sid);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        VerifiedSession::from_request_parts(&mut parts, state).await
    }

    #[tokio::test]
    async fn matching_session_header_is_authorized() {
        let state = test_state();
        let token = state.0.sign("sess-1", "caller", 1).unwrap();
        let result = extract(&state, Some(&token), Some("sess-1")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn mismatched_session_header_is_forbidden() {
        let state = test_state();
        let token = state.0.sign("sess-1", "caller", 1).unwrap();
        let result = extract(&state, Some(&token), Some("sess-2")).await;
        assert!(matches!(result, Err(MiddlewareRejection::Forbidden)));
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let state = test_state();
        let result = extract(&state, None, Some("sess-1")).await;
        assert!(matches!(result, Err(MiddlewareRejection::Unauthorized)));
    }

    #[tokio::test]
    async fn missing_session_header_is_forbidden() {
        let state = test_state();
        let token = state.0.sign("sess-1", "caller", 1).unwrap();
        let result = extract(&state, Some(&token), None).await;
        assert!(matches!(result, Err(MiddlewareRejection::Forbidden)));
    }
}
