//! Bearer token verification.
//!
//! Tokens have the form `<user id>.<hex HMAC-SHA256 of the user id>`. Login
//! and token issuance live elsewhere; [`AuthKey::issue`] exists for tooling
//! and tests.

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ChatError;
use crate::model::UserId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AuthKey {
    secret: Vec<u8>,
}

impl AuthKey {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    pub fn issue(&self, user: &UserId) -> String {
        let mut mac = self.mac();
        mac.update(user.as_str().as_bytes());
        format!("{}.{}", user, hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ChatError> {
        let (raw_user, signature) = token
            .trim()
            .rsplit_once('.')
            .ok_or_else(|| ChatError::Authorization("Malformed token".to_string()))?;

        let user = UserId::parse(raw_user)
            .map_err(|_| ChatError::Authorization("Malformed token".to_string()))?;
        let signature = hex::decode(signature)
            .map_err(|_| ChatError::Authorization("Malformed token".to_string()))?;

        let mut mac = self.mac();
        mac.update(user.as_str().as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ChatError::Authorization("Invalid token".to_string()))?;

        Ok(user)
    }

    /// Resolve an `Authorization: Bearer <token>` header value.
    pub fn verify_header(&self, header: Option<&str>) -> Result<UserId, ChatError> {
        let header = header
            .ok_or_else(|| ChatError::Authorization("Missing bearer token".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ChatError::Authorization("Missing bearer token".to_string()))?;
        self.verify(token)
    }
}

/// The authenticated caller of a REST handler.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AuthKey: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let key = AuthKey::from_ref(state);
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        key.verify_header(header).map(AuthUser)
    }
}
