//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the workspace registry, the consumed-ticket registry, the ticket
//! verifier, and runtime config. Each workspace owns its members, locks,
//! shared-state maps, version metadata, and permission state; every mutation
//! to one workspace runs under the registry write lock, which realises the
//! single-writer-per-workspace discipline.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::services::entity::{EntityKey, EntityMeta};
use crate::services::lock::ElementLock;
use crate::services::permission::{PermissionSet, Role, WorkspacePermissions};
use crate::services::ticket::{TicketRegistry, TicketVerifier};

/// Per-member outbound queue depth. Frames beyond this are dropped rather
/// than blocking the mutation critical section.
pub const OUTBOUND_CAPACITY: usize = 256;

// =============================================================================
// OUTBOUND CHANNEL
// =============================================================================

/// Messages queued to a connection's socket task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A JSON frame to deliver.
    Frame(Value),
    /// Close the socket with an application close code, then stop.
    Close { code: u16, reason: String },
}

// =============================================================================
// MEMBER
// =============================================================================

/// One authenticated connection in a workspace.
#[derive(Debug)]
pub struct Member {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    /// Cached effective set, refreshed on every permission mutation. Gates
    /// recompute from [`WorkspacePermissions`]; this copy feeds user lists.
    pub permissions: PermissionSet,
    pub coords: Option<Value>,
    /// Identifies the connection occupying this member slot. A closing
    /// socket whose id no longer matches was replaced by a reconnect and
    /// must not clean up.
    pub conn_id: Uuid,
    pub tx: mpsc::Sender<Outbound>,
}

// =============================================================================
// WORKSPACE STATE
// =============================================================================

/// A shared element: its kind string plus the client-supplied payload.
#[derive(Debug, Clone)]
pub struct ElementRecord {
    pub kind: String,
    pub data: Value,
}

/// Per-workspace live state. RAM-only; destroyed after the empty-retention
/// interval elapses with no members.
pub struct WorkspaceState {
    /// User who caused this workspace to be created; sticky until teardown.
    pub owner_id: String,
    /// Members keyed by user id — at most one per user.
    pub members: HashMap<String, Member>,
    /// Held locks keyed by element id.
    pub locks: HashMap<String, ElementLock>,
    /// Last granted lock version per element, retained across release.
    pub lock_versions: HashMap<String, u64>,
    /// Shared elements keyed by element id.
    pub elements: HashMap<String, ElementRecord>,
    /// Derived sprite metrics keyed by sprite id.
    pub sprite_metrics: HashMap<String, Value>,
    /// Serialized workspace snapshots keyed by sprite id.
    pub snapshots: HashMap<String, String>,
    /// Version metadata keyed by `(kind, id)`.
    pub versions: HashMap<EntityKey, EntityMeta>,
    /// Global/override/preset permission state.
    pub permissions: WorkspacePermissions,
    /// Pending empty-workspace teardown timer, if armed.
    pub cleanup: Option<JoinHandle<()>>,
}

impl WorkspaceState {
    #[must_use]
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            members: HashMap::new(),
            locks: HashMap::new(),
            lock_versions: HashMap::new(),
            elements: HashMap::new(),
            sprite_metrics: HashMap::new(),
            snapshots: HashMap::new(),
            versions: HashMap::new(),
            permissions: WorkspacePermissions::new(),
            cleanup: None,
        }
    }
}

impl Drop for WorkspaceState {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum — all inner fields
/// are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<RwLock<HashMap<String, WorkspaceState>>>,
    pub tickets: TicketRegistry,
    pub verifier: Arc<TicketVerifier>,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, verifier: TicketVerifier) -> Self {
        Self {
            workspaces: Arc::new(RwLock::new(HashMap::new())),
            tickets: TicketRegistry::new(),
            verifier: Arc::new(verifier),
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
