//! Connection authentication
//!
//! Tokens are issued by the account service; this side only verifies them.

use std::sync::Arc;

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuthConfig;
use crate::{Error, Result};

/// Display name used for connections admitted without a token
pub const ANONYMOUS: &str = "anonymous";

/// Claims carried by account-service access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub userid: i64,
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// Verified identity of a connecting client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<i64>,
    pub display_name: String,
}

impl Identity {
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            display_name: ANONYMOUS.to_string(),
        }
    }
}

pub trait Authenticator: Send + Sync {
    /// Resolve the identity behind `token`, `None` when the client sent none.
    fn authenticate(&self, token: Option<&str>) -> Result<Identity>;
}

/// HS256 verifier for account-service tokens
#[derive(Clone)]
pub struct JwtAuthenticator {
    decoding_key: Arc<DecodingKey>,
    allow_anonymous: bool,
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("allow_anonymous", &self.allow_anonymous)
            .finish_non_exhaustive()
    }
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(secret: &[u8], allow_anonymous: bool) -> Self {
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            allow_anonymous,
        }
    }

    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.jwt_secret.as_bytes(), config.allow_anonymous)
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 60; // clock skew
        validation.set_required_spec_claims(&["exp"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::Authentication("Token expired".to_string()),
                ErrorKind::InvalidSignature => {
                    Error::Authentication("Invalid token signature".to_string())
                }
                _ => Error::Authentication(format!("Token verification failed: {e}")),
            })
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Result<Identity> {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => {
                let claims = self.verify(token)?;
                debug!(user_id = claims.userid, username = %claims.username, "Token verified");
                Ok(Identity {
                    user_id: Some(claims.userid),
                    display_name: claims.username,
                })
            }
            None if self.allow_anonymous => Ok(Identity::anonymous()),
            None => Err(Error::Authentication("Missing access token".to_string())),
        }
    }
}

/// Access token carried in the `cookie_name` cookie of a `Cookie` header
#[must_use]
pub fn token_from_cookie(cookie_header: &str, cookie_name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == cookie_name && !value.is_empty()).then(|| value.to_string())
    })
}
