use std::fmt;

use async_trait::async_trait;

use super::error::{Result, SeclayError};

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// What the caller presents to open a connection.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    // ---
    /// Long-lived API token issued to a user.
    ApiToken(String),

    /// Token issued to an edge device.
    EdgeToken(String),

    /// No credentials; for local peers and tests.
    Anonymous,
}

// ---

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiToken(_) => f.write_str("ApiToken(***)"),
            Credentials::EdgeToken(_) => f.write_str("EdgeToken(***)"),
            Credentials::Anonymous => f.write_str("Anonymous"),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthToken
// ---------------------------------------------------------------------------

/// Result of authentication; attached to the socket handshake as a header.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthToken {
    Bearer(String),
    Edge(String),
    None,
}

// ---

impl AuthToken {
    // ---
    /// The connection header carrying this token, if any.
    pub fn header(&self) -> Option<(String, String)> {
        // ---
        match self {
            AuthToken::Bearer(t) => Some(("Authorization".into(), format!("Bearer {t}"))),
            AuthToken::Edge(t) => Some(("X-Edge-Token".into(), t.clone())),
            AuthToken::None => None,
        }
    }
}

// ---

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthToken::Bearer(_) => f.write_str("Bearer(***)"),
            AuthToken::Edge(_) => f.write_str("Edge(***)"),
            AuthToken::None => f.write_str("None"),
        }
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Exchanges [`Credentials`] for an [`AuthToken`].
///
/// Called once per socket (re)connect, before the socket is opened.
#[async_trait]
pub trait Authenticator: Send + Sync {
    // ---
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken>;
}

// ---

/// Uses the presented token as-is. Suitable when tokens are pre-issued.
/// An empty token is refused before any socket is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughAuth;

// ---

#[async_trait]
impl Authenticator for PassthroughAuth {
    // ---
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken> {
        // ---
        Ok(match credentials {
            Credentials::ApiToken(t) | Credentials::EdgeToken(t) if t.trim().is_empty() => {
                return Err(SeclayError::Auth("empty token".into()));
            }
            Credentials::ApiToken(t) => AuthToken::Bearer(t.clone()),
            Credentials::EdgeToken(t) => AuthToken::Edge(t.clone()),
            Credentials::Anonymous => AuthToken::None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
