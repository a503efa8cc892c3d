//! Identities, roles, and bearer-token resolution.
//!
//! Tokens are `base64url(claims) "." base64url(HMAC-SHA256(claims))`.
//! The claims only carry the subject and expiry; the role is always read
//! from the user directory so a demotion takes effect on the next connect.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::db::Db;
use crate::error::{AuthError, UnknownVariant};

type HmacSha256 = Hmac<Sha256>;

/// Reserved id of the support pseudo-user. Never a real account.
pub const SUPPORT_ID: &str = "support";

/// One endpoint of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Identity {
    User(String),
    Support,
}

impl Identity {
    pub fn parse(raw: &str) -> Self {
        if raw == SUPPORT_ID {
            Identity::Support
        } else {
            Identity::User(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identity::User(id) => id,
            Identity::Support => SUPPORT_ID,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User(id) => Some(id),
            Identity::Support => None,
        }
    }

    pub fn is_support(&self) -> bool {
        matches!(self, Identity::Support)
    }
}

impl From<String> for Identity {
    fn from(raw: String) -> Self {
        if raw == SUPPORT_ID { Identity::Support } else { Identity::User(raw) }
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        match id {
            Identity::User(id) => id,
            Identity::Support => SUPPORT_ID.to_string(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Client,
    Talent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Client => "client",
            Role::Talent => "talent",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "client" => Ok(Role::Client),
            "talent" => Ok(Role::Talent),
            other => Err(UnknownVariant { kind: "role", value: other.to_string() }),
        }
    }
}

/// An authenticated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self { user_id: user_id.into(), role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn identity(&self) -> Identity {
        Identity::User(self.user_id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Verifies bearer tokens and maps them to principals.
#[derive(Clone)]
pub struct TokenResolver {
    mac: HmacSha256,
}

impl TokenResolver {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .expect("HMAC accepts keys of any length");
        Self { mac }
    }

    /// Resolver with a throwaway secret. Tokens die with the process.
    pub fn random() -> Self {
        let secret: [u8; 32] = rand::random();
        Self::new(secret)
    }

    pub fn issue(&self, user_id: &str, ttl: chrono::Duration) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        self.encode(&claims)
    }

    pub fn encode(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims).unwrap_or_else(|e| {
            tracing::warn!(sub = %claims.sub, error = %e, "failed to encode token claims");
            Vec::new()
        });
        let body = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.mac.clone();
        mac.update(body.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{body}.{sig}")
    }

    /// Check signature and expiry. Does not consult the user directory.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let (body, sig) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(body.as_bytes());
        mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD.decode(body).map_err(|_| AuthError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    /// Full resolution: token → (user id, role).
    pub fn resolve(&self, token: &str, db: &Db) -> Result<Principal, AuthError> {
        let claims = self.verify(token)?;
        match db.get_user(&claims.sub) {
            Ok(Some(user)) => Ok(Principal::new(user.id, user.role)),
            Ok(None) => Err(AuthError::UnknownUser(claims.sub)),
            Err(e) => Err(AuthError::Unavailable(e.to_string())),
        }
    }
}
