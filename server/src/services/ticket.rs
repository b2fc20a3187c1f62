//! Join-ticket verification and single-use admission tracking.
//!
//! ARCHITECTURE
//! ============
//! Another service signs short-lived HS256 tickets; we only verify them.
//! A ticket proves `(sub, workspaceId)` and carries a unique `jti`. Consumed
//! `jti`s are remembered until their `exp` so a stolen ticket cannot admit a
//! different user or workspace, while the original holder may replay it for
//! reload/reconnect until expiry.
//!
//! TRADE-OFFS
//! ==========
//! The consumed map is pruned on every admission attempt rather than by a
//! background sweeper; admission is the only path that grows it, so the map
//! stays bounded by the number of live tickets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Audience every join ticket must be addressed to.
pub const AUDIENCE: &str = "colab-backend";

/// Signing secret accepted outside production when no real secret is set.
const DEV_FALLBACK_SECRET: &str = "colab-dev-secret";

const MAX_USER_ID_LEN: usize = 128;
const MAX_WORKSPACE_ID_LEN: usize = 128;

// =============================================================================
// CLAIMS
// =============================================================================

/// Claims carried by a join ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id asserted by the platform.
    pub sub: String,
    /// Workspace the ticket admits into.
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    /// Must equal [`AUDIENCE`].
    pub aud: String,
    /// Unique ticket id used for replay tracking.
    pub jti: String,
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional platform role (`"ADMIN"`, `"TEACHER"`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Closed set of admission failures. Each maps to a wire reason string and
/// the connection is closed with application code 4003.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("missing join ticket")]
    Missing,
    #[error("invalid join ticket: {0}")]
    Invalid(String),
    #[error("join ticket expired")]
    Expired,
    #[error("ticket workspace does not match")]
    WorkspaceMismatch,
    #[error("ticket user does not match")]
    UserMismatch,
    #[error("ticket already used by another session")]
    Replayed,
}

impl AdmissionError {
    /// Stable reason token surfaced to the client alongside the close code.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid(_) => "invalid",
            Self::Expired => "expired",
            Self::WorkspaceMismatch => "workspace-mismatch",
            Self::UserMismatch => "user-mismatch",
            Self::Replayed => "replay",
        }
    }
}

// =============================================================================
// VERIFIER
// =============================================================================

/// Validates ticket signatures and claim shape.
pub struct TicketVerifier {
    /// `None` means no secret is available (production without config):
    /// every admission is refused.
    secret: Option<String>,
}

impl TicketVerifier {
    #[must_use]
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    /// Resolve the signing secret: `COLAB_JOIN_TOKEN_SECRET`, then
    /// `CRON_SECRET`, then the dev fallback outside production.
    #[must_use]
    pub fn from_env(production: bool) -> Self {
        let secret = std::env::var("COLAB_JOIN_TOKEN_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("CRON_SECRET").ok().filter(|s| !s.is_empty()))
            .or_else(|| (!production).then(|| DEV_FALLBACK_SECRET.to_string()));
        if secret.is_none() {
            tracing::warn!("no join-ticket secret configured; all admissions will be refused");
        }
        Self::new(secret)
    }

    /// Verify signature, expiry, audience, and claim bounds.
    ///
    /// # Errors
    ///
    /// Returns an [`AdmissionError`] describing the first failed check.
    pub fn verify(&self, token: &str) -> Result<Claims, AdmissionError> {
        let Some(secret) = self.secret.as_deref() else {
            return Err(AdmissionError::Invalid("no signing secret configured".into()));
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);

        let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AdmissionError::Expired,
                _ => AdmissionError::Invalid(e.to_string()),
            })?;
        let claims = data.claims;

        if claims.sub.is_empty() || claims.sub.len() > MAX_USER_ID_LEN {
            return Err(AdmissionError::Invalid("bad sub claim".into()));
        }
        if claims.workspace_id.is_empty() || claims.workspace_id.len() > MAX_WORKSPACE_ID_LEN {
            return Err(AdmissionError::Invalid("bad workspaceId claim".into()));
        }
        if claims.jti.is_empty() {
            return Err(AdmissionError::Invalid("bad jti claim".into()));
        }

        Ok(claims)
    }
}

// =============================================================================
// CONSUMED-TICKET REGISTRY
// =============================================================================

#[derive(Debug, Clone)]
struct ConsumedTicket {
    expires_at: u64,
    sub: String,
    workspace_id: String,
}

/// Tracks consumed `jti`s until they expire.
#[derive(Clone)]
pub struct TicketRegistry {
    inner: Arc<Mutex<HashMap<String, ConsumedTicket>>>,
}

impl TicketRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Record a ticket consumption, enforcing the replay rule: a `jti`
    /// already consumed by a different `(sub, workspaceId)` pair is refused;
    /// the original pair may reuse it until expiry.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Replayed`] when the jti belongs to another
    /// session.
    pub fn consume(&self, claims: &Claims) -> Result<(), AdmissionError> {
        self.consume_at(claims, now_secs())
    }

    /// Internal: consume with an explicit clock (for testing).
    fn consume_at(&self, claims: &Claims, now: u64) -> Result<(), AdmissionError> {
        let mut map = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        // Prune on every admission attempt.
        map.retain(|_, ticket| ticket.expires_at > now);

        if let Some(existing) = map.get(&claims.jti) {
            if existing.sub != claims.sub || existing.workspace_id != claims.workspace_id {
                return Err(AdmissionError::Replayed);
            }
        }

        map.insert(
            claims.jti.clone(),
            ConsumedTicket {
                expires_at: claims.exp,
                sub: claims.sub.clone(),
                workspace_id: claims.workspace_id.clone(),
            },
        );
        Ok(())
    }

    /// Number of live consumed entries (diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TicketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time as whole seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// TESTS
// =============================================================================
