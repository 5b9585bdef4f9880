use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BEARER_PREFIX: &str = "Bearer ";

// Auth-gate failures; every variant maps to 401
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed credential")]
    MalformedCredential,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::ImmatureSignature => AuthError::NotYetValid,
            _ => AuthError::MalformedCredential,
        }
    }
}

// Signed claims carried by a bearer credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Token verification seam used by the dispatcher.
///
/// Takes the raw `Authorization` header value and returns the subject.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, authorization: &str) -> Result<String, AuthError>;
}

/// HS256 bearer token verifier (and issuer) over a shared secret.
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["sub", "iat", "nbf", "exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Issue a credential for `subject`, valid from now until `now + ttl`.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            tracing::error!(error = %e, "Failed to encode token");
            AuthError::from(e)
        })
    }

    // Decode a bare token (no bearer prefix)
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, authorization: &str) -> Result<String, AuthError> {
        let token = authorization
            .strip_prefix(BEARER_PREFIX)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MalformedCredential)?;

        let claims = self.decode(token)?;
        Ok(claims.sub)
    }
}
