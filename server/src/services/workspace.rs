//! Workspace registry — admission, take-over, teardown, and fan-out.
//!
//! DESIGN
//! ======
//! Workspaces are created lazily on first successful admission and destroyed
//! by a single-shot cleanup timer after the empty-retention interval. A
//! second admission for a user id already present replaces the prior
//! connection: the old socket is closed with code 4001 and its close handler
//! finds a foreign `conn_id` in the member slot, so it releases nothing.
//!
//! ERROR HANDLING
//! ==============
//! Fan-out is best-effort: a member whose outbound queue is full simply
//! misses the frame (logged); delivery never blocks the mutation path.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::{now_ms, CLOSE_REPLACED, REPLACED_REASON};
use crate::services::{lock, permission};
use crate::services::permission::{PermissionSet, Role};
use crate::state::{AppState, Member, Outbound, WorkspaceState};

// =============================================================================
// FAN-OUT
// =============================================================================

/// Queue a frame to every member except `exclude` (`None` means everyone).
pub fn fan_out(ws: &WorkspaceState, workspace_id: &str, exclude: Option<&str>, frame: &Value) {
    for (user_id, member) in &ws.members {
        if exclude == Some(user_id.as_str()) {
            continue;
        }
        if member.tx.try_send(Outbound::Frame(frame.clone())).is_err() {
            warn!(%workspace_id, %user_id, "outbound queue full; dropping frame");
        }
    }
}

/// Broadcast a frame to a workspace's members, optionally excluding one.
pub async fn broadcast(state: &AppState, workspace_id: &str, exclude: Option<&str>, frame: &Value) {
    let workspaces = state.workspaces.read().await;
    let Some(ws) = workspaces.get(workspace_id) else {
        return;
    };
    fan_out(ws, workspace_id, exclude, frame);
}

// =============================================================================
// USER AND SHARED-STATE PAYLOADS
// =============================================================================

/// Wire payload describing one member.
#[must_use]
pub fn user_payload(ws: &WorkspaceState, member: &Member) -> Value {
    json!({
        "userId": member.user_id,
        "username": member.username,
        "role": member.role.as_str(),
        "permissions": member.permissions,
        "isOwner": member.user_id == ws.owner_id,
    })
}

/// Snapshot of the workspace's shared state: elements, sprite metrics, and
/// workspace snapshots, each with version metadata and ETag.
#[must_use]
pub fn shared_state_value(ws: &WorkspaceState) -> Value {
    let elements: Vec<Value> = ws
        .elements
        .iter()
        .map(|(id, record)| {
            let mut entry = json!({
                "elementType": record.kind,
                "elementId": id,
                "data": record.data,
            });
            merge_meta(&mut entry, ws, &record.kind, id);
            entry
        })
        .collect();

    let sprite_metrics: Vec<Value> = ws
        .sprite_metrics
        .iter()
        .map(|(id, metrics)| {
            let mut entry = json!({ "spriteId": id, "metrics": metrics });
            merge_meta(&mut entry, ws, crate::services::entity::KIND_SPRITE_METRICS, id);
            entry
        })
        .collect();

    let snapshots: Vec<Value> = ws
        .snapshots
        .iter()
        .map(|(id, serialized)| {
            let mut entry = json!({ "spriteId": id, "snapshot": serialized });
            merge_meta(&mut entry, ws, crate::services::entity::KIND_WORKSPACE_SNAPSHOT, id);
            entry
        })
        .collect();

    json!({
        "elements": elements,
        "spriteMetrics": sprite_metrics,
        "workspaceSnapshots": snapshots,
    })
}

fn merge_meta(entry: &mut Value, ws: &WorkspaceState, kind: &str, id: &str) {
    let Some(meta) = ws.versions.get(&(kind.to_string(), id.to_string())) else {
        return;
    };
    let Some(obj) = entry.as_object_mut() else {
        return;
    };
    obj.insert("version".into(), json!(meta.version));
    obj.insert("etag".into(), json!(meta.etag(kind, id)));
    obj.insert("firstEditedBy".into(), json!(meta.first_edited_by));
    obj.insert("firstEditedAt".into(), json!(meta.first_edited_at));
    obj.insert("updatedBy".into(), json!(meta.updated_by));
    obj.insert("updatedAt".into(), json!(meta.updated_at));
}

// =============================================================================
// ADMISSION
// =============================================================================

/// Result of attaching a member to a workspace.
pub struct AttachOutcome {
    /// Whether an existing connection for the same user was replaced.
    pub replaced: bool,
    pub is_owner: bool,
    pub permissions: PermissionSet,
    /// Current member list payloads, including the new member.
    pub users: Vec<Value>,
    pub shared_state: Value,
}

/// Attach an authenticated connection to a workspace, creating the workspace
/// on first use and replacing any prior connection for the same user id.
/// Broadcasts `user_joined` (or `user_updated` on replacement) to the rest
/// of the workspace.
pub async fn attach_member(
    state: &AppState,
    workspace_id: &str,
    user_id: &str,
    username: String,
    role: Role,
    conn_id: Uuid,
    tx: mpsc::Sender<Outbound>,
) -> AttachOutcome {
    let mut workspaces = state.workspaces.write().await;
    let ws = workspaces
        .entry(workspace_id.to_string())
        .or_insert_with(|| {
            info!(%workspace_id, owner = %user_id, "created workspace");
            WorkspaceState::new(user_id)
        });

    // A pending teardown is cancelled by any admission.
    if let Some(handle) = ws.cleanup.take() {
        handle.abort();
        info!(%workspace_id, "cancelled empty-workspace cleanup");
    }

    let replaced = match ws.members.get(user_id) {
        Some(prior) => {
            // Silent take-over: the old socket closes with 4001 and must not
            // release locks or emit user_left.
            let _ = prior.tx.try_send(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: REPLACED_REASON.to_string(),
            });
            info!(%workspace_id, %user_id, "replacing prior connection");
            true
        }
        None => false,
    };

    let permissions = permission::effective(&ws.permissions, role, user_id);
    ws.members.insert(
        user_id.to_string(),
        Member {
            user_id: user_id.to_string(),
            username,
            role,
            permissions,
            coords: None,
            conn_id,
            tx,
        },
    );

    let member = &ws.members[user_id];
    let announcement = user_payload(ws, member);
    let kind = if replaced { "user_updated" } else { "user_joined" };
    let mut frame = announcement;
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("type".into(), json!(kind));
    }
    fan_out(ws, workspace_id, Some(user_id), &frame);

    let users: Vec<Value> = ws.members.values().map(|m| user_payload(ws, m)).collect();
    info!(%workspace_id, %user_id, members = ws.members.len(), "member joined workspace");

    AttachOutcome {
        replaced,
        is_owner: user_id == ws.owner_id,
        permissions,
        users,
        shared_state: shared_state_value(ws),
    }
}

// =============================================================================
// DETACH AND TEARDOWN
// =============================================================================

/// Handle a socket close for an authenticated connection. Returns `false`
/// when the member slot was already taken over by a newer connection (the
/// take-over discipline: nothing is released, nothing is broadcast).
pub async fn detach_member(state: &AppState, workspace_id: &str, user_id: &str, conn_id: Uuid) -> bool {
    let mut workspaces = state.workspaces.write().await;
    let Some(ws) = workspaces.get_mut(workspace_id) else {
        return false;
    };
    match ws.members.get(user_id) {
        Some(member) if member.conn_id == conn_id => {}
        _ => return false,
    }

    let released = lock::release_all(&mut ws.locks, user_id);
    ws.members.remove(user_id);

    for element_id in &released {
        let frame = json!({ "type": "element_unlocked", "elementId": element_id, "userId": user_id });
        fan_out(ws, workspace_id, None, &frame);
    }
    let frame = json!({ "type": "user_left", "userId": user_id });
    fan_out(ws, workspace_id, None, &frame);

    info!(%workspace_id, %user_id, remaining = ws.members.len(), locks_released = released.len(), "member left workspace");

    if ws.members.is_empty() {
        arm_cleanup(state, ws, workspace_id);
    }
    true
}

/// Arm the single-shot teardown timer for an empty workspace. Replaces any
/// previously armed timer, keeping at most one per workspace.
fn arm_cleanup(state: &AppState, ws: &mut WorkspaceState, workspace_id: &str) {
    if let Some(handle) = ws.cleanup.take() {
        handle.abort();
    }

    let retention = state.config.empty_workspace_retention;
    info!(%workspace_id, retention_ms = retention.as_millis() as u64, "armed empty-workspace cleanup");

    let state = state.clone();
    let workspace_id = workspace_id.to_string();
    ws.cleanup = Some(tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        let mut workspaces = state.workspaces.write().await;
        let still_empty = match workspaces.get_mut(&workspace_id) {
            Some(ws) if ws.members.is_empty() => {
                // Drop our own handle before removal so Drop doesn't abort
                // this task mid-teardown.
                ws.cleanup = None;
                true
            }
            _ => false,
        };
        if still_empty {
            workspaces.remove(&workspace_id);
            info!(%workspace_id, "destroyed empty workspace");
        }
    }));
}

// =============================================================================
// QUERIES
// =============================================================================

/// Number of live workspaces (health endpoint).
pub async fn workspace_count(state: &AppState) -> usize {
    state.workspaces.read().await.len()
}

/// Presence info for one workspace, or `None` if it does not exist.
pub async fn workspace_info(state: &AppState, workspace_id: &str) -> Option<Value> {
    let workspaces = state.workspaces.read().await;
    let ws = workspaces.get(workspace_id)?;
    let users: Vec<Value> = ws
        .members
        .values()
        .map(|m| json!({ "userId": m.user_id, "coords": m.coords }))
        .collect();
    Some(json!({
        "workspaceId": workspace_id,
        "users": users,
        "userCount": ws.members.len(),
    }))
}

/// Health payload: status, live workspace count, server time.
pub async fn health(state: &AppState) -> Value {
    json!({
        "status": "ok",
        "workspaces": workspace_count(state).await,
        "timestamp": now_ms(),
    })
}

#[cfg(test)]
#[path = "workspace_test.rs"]
mod tests;
