//! Short-lived session-bound credential signing and verification.

pub mod bootstrap;
pub mod middleware;

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Claims embedded in every signed session token (§4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sid: String,
    pub sub: String,
    pub ver: u32,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("signing/verification key not loaded")]
    KeyNotLoaded,
    #[error("token malformed")]
    TokenMalformed,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("issuer mismatch")]
    IssuerMismatch,
    #[error("audience mismatch")]
    AudienceMismatch,
    #[error("session id missing")]
    SessionMissing,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token expired")]
    Expired,
}

/// Signs and verifies RS256 tokens binding a session-id to a caller.
pub struct CredentialService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    kid: String,
    ttl: Duration,
    clock_skew: Duration,
}

impl CredentialService {
    pub fn from_pem(
        private_pem: &[u8],
        public_pem: &[u8],
        issuer: impl Into<String>,
        audience: impl Into<String>,
        kid: impl Into<String>,
        ttl: Duration,
        clock_skew: Duration,
    ) -> Result<Self, CredentialError> {
        let encoding_key =
            EncodingKey::from_rsa_pem(private_pem).map_err(|_| CredentialError::KeyNotLoaded)?;
        let decoding_key =
            DecodingKey::from_rsa_pem(public_pem).map_err(|_| CredentialError::KeyNotLoaded)?;
        Ok(Self {
            encoding_key,
            decoding_key,
            issuer: issuer.into(),
            audience: audience.into(),
            kid: kid.into(),
            ttl,
            clock_skew,
        })
    }

    /// Produces a compact `header.claims.signature` token bound to `session_id`.
    pub fn sign(
        &self,
        session_id: &str,
        subject: &str,
        version: u32,
    ) -> Result<String, CredentialError> {
        if session_id.is_empty() {
            return Err(CredentialError::SessionMissing);
        }
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sid: session_id.to_owned(),
            sub: subject.to_owned(),
            ver: version,
            iat: now,
            nbf: now,
            exp: now + self.ttl.as_secs() as i64,
            jti: random_jti(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, &claims, &self.encoding_key).map_err(|_| CredentialError::KeyNotLoaded)
    }

    /// Verifies signature, issuer, audience, and time bounds (with clock-skew
    /// tolerance); rejects malformed or extra-segment tokens outright.
    pub fn verify(&self, token: &str) -> Result<Claims, CredentialError> {
        if token.split('.').count() != 3 {
            return Err(CredentialError::TokenMalformed);
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::InvalidSignature => CredentialError::SignatureInvalid,
                _ => CredentialError::TokenMalformed,
            }
        })?;
        let claims = data.claims;

        if claims.sid.is_empty() {
            return Err(CredentialError::SessionMissing);
        }
        if claims.iss != self.issuer {
            return Err(CredentialError::IssuerMismatch);
        }
        if claims.aud != self.audience {
            return Err(CredentialError::AudienceMismatch);
        }

        let now = Utc::now().timestamp();
        let skew = self.clock_skew.as_secs() as i64;
        if claims.nbf > now + skew || claims.iat > now + skew {
            return Err(CredentialError::NotYetValid);
        }
        if claims.exp <= now - skew {
            return Err(CredentialError::Expired);
        }

        Ok(claims)
    }
}

fn random_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;

    fn keypair_pems() -> (String, String) {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = private.to_public_key();
        let private_pem = private
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = public.to_public_key_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        (private_pem, public_pem)
    }

    fn service_with(
        private_pem: &str,
        public_pem: &str,
        issuer: &str,
        audience: &str,
        ttl: Duration,
        clock_skew: Duration,
    ) -> CredentialService {
        CredentialService::from_pem(
            private_pem.as_bytes(),
            public_pem.as_bytes(),
            issuer,
            audience,
            "agentland-1",
            ttl,
            clock_skew,
        )
        .unwrap()
    }

    fn test_service(ttl: Duration, clock_skew: Duration) -> CredentialService {
        let (private_pem, public_pem) = keypair_pems();
        service_with(
            &private_pem,
            &public_pem,
            "agentland-gateway",
            "agentland-sandbox",
            ttl,
            clock_skew,
        )
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let svc = test_service(Duration::from_secs(300), Duration::from_secs(30));
        let token = svc.sign("sess-1", "caller", 1).unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.sid, "sess-1");
        assert_eq!(claims.sub, "caller");
    }

    #[test]
    fn sign_rejects_empty_session_id() {
        let svc = test_service(Duration::from_secs(300), Duration::from_secs(30));
        assert!(matches!(
            svc.sign("", "caller", 1),
            Err(CredentialError::SessionMissing)
        ));
    }

    #[test]
    fn verify_rejects_malformed_token() {
        let svc = test_service(Duration::from_secs(300), Duration::from_secs(30));
        assert!(matches!(
            svc.verify("not-a-jwt"),
            Err(CredentialError::TokenMalformed)
        ));
        assert!(matches!(
            svc.verify("a.b.c.d"),
            Err(CredentialError::TokenMalformed)
        ));
    }

    #[test]
    fn verify_rejects_wrong_issuer() {
        let (private_pem, public_pem) = keypair_pems();
        let signer = service_with(
            &private_pem,
            &public_pem,
            "issuer-a",
            "agentland-sandbox",
            Duration::from_secs(300),
            Duration::from_secs(30),
        );
        let verifier = service_with(
            &private_pem,
            &public_pem,
            "issuer-b",
            "agentland-sandbox",
            Duration::from_secs(300),
            Duration::from_secs(30),
        );
        let token = signer.sign("sess-1", "caller", 1).unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(CredentialError::IssuerMismatch)
        ));
    }

    #[test]
    fn from_pem_rejects_garbage_key_material() {
        assert!(matches!(
            CredentialService::from_pem(
                b"not a pem",
                b"not a pem",
                "x",
                "x",
                "x",
                Duration::from_secs(1),
                Duration::from_secs(1),
            ),
            Err(CredentialError::KeyNotLoaded)
        ));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let svc = test_service(Duration::from_secs(0), Duration::from_secs(0));
        let token = svc.sign("sess-1", "caller", 1).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(matches!(svc.verify(&token), Err(CredentialError::Expired)));
    }

    #[test]
    fn verify_rejects_token_signed_with_different_key() {
        let svc_a = test_service(Duration::from_secs(300), Duration::from_secs(30));
        let svc_b = test_service(Duration::from_secs(300), Duration::from_secs(30));
        let token = svc_a.sign("sess-1", "caller", 1).unwrap();
        assert!(matches!(
            svc_b.verify(&token),
            Err(CredentialError::SignatureInvalid)
        ));
    }
}
