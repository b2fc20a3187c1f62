//! WebSocket handler — admission, frame dispatch, and fan-out.
//!
//! DESIGN
//! ======
//! On upgrade the connection enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by `type`
//! - Queued outbound traffic from workspace peers → forward to the socket
//!
//! Handlers validate, mutate workspace state under the registry write guard,
//! queue broadcasts, and return reply frames for the sender. Everything a
//! handler does to one workspace happens inside a single critical section,
//! which is the single-writer discipline.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → wait for an `auth` frame (everything else is refused)
//! 2. Admission verifies the join ticket, attaches the member, and replies
//!    `auth_success`; a rejected admission closes with code 4003
//! 3. A later `auth` for the same user id replaces this connection: it is
//!    closed with code 4001 and its close handler releases nothing
//! 4. Close → release held locks, broadcast `user_left`, and arm the
//!    empty-workspace cleanup timer if the member was the last one

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::{error_frame, if_match_of, now_ms, ClientMessage, CLOSE_REJECTED};
use crate::services::entity::{
    self, VersionConflict, KIND_BLOCK, KIND_SPRITE, KIND_SPRITE_METRICS, KIND_WORKSPACE_SNAPSHOT,
};
use crate::services::lock::{self, LockDecision};
use crate::services::permission::{self, PermissionSet, PresetMode, Role};
use crate::services::ticket::{AdmissionError, Claims};
use crate::services::workspace::{self, fan_out};
use crate::state::{AppState, ElementRecord, Outbound, WorkspaceState, OUTBOUND_CAPACITY};

const MAX_USERNAME_LEN: usize = 64;
const MAX_SNAPSHOT_CHARS: usize = 2_000_000;

/// Message types the dispatcher understands; used to tell a malformed known
/// frame apart from an unknown one.
const KNOWN_TYPES: [&str; 19] = [
    "auth",
    "request_shared_state",
    "request_teacher_role",
    "update_username",
    "update_global_permission",
    "update_user_permission",
    "apply_preset_mode",
    "request_lock",
    "release_lock",
    "update_coords",
    "element_drag",
    "block_move",
    "block_focus",
    "sprite_update",
    "stack_move",
    "action",
    "create_element",
    "delete_element",
    "workspace_snapshot",
];

// =============================================================================
// CONNECTION
// =============================================================================

/// Per-connection context threaded through the dispatch loop.
struct ConnSession {
    conn_id: Uuid,
    /// This connection's own outbound queue; also handed to the member slot
    /// so peers (and admission control) can reach the socket.
    tx: mpsc::Sender<Outbound>,
    auth: Option<AuthContext>,
}

#[derive(Clone)]
struct AuthContext {
    workspace_id: String,
    user_id: String,
}

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    let mut session = ConnSession { conn_id: Uuid::new_v4(), tx, auth: None };
    info!(conn_id = %session.conn_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut session, &text).await;
                        for frame in replies {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(out) = rx.recv() => {
                match out {
                    Outbound::Frame(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    // Close handler: a replaced connection finds a foreign conn_id in the
    // member slot and releases nothing.
    if let Some(auth) = session.auth.take() {
        workspace::detach_member(&state, &auth.workspace_id, &auth.user_id, session.conn_id).await;
    }
    info!(conn_id = %session.conn_id, "ws: client disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &Value) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame, returning reply frames for the
/// sender. Broadcasts to peers are queued as a side effect.
///
/// This seam keeps websocket transport concerns separate from frame handling
/// so tests can exercise the dispatcher end-to-end.
async fn process_inbound_text(state: &AppState, session: &mut ConnSession, text: &str) -> Vec<Value> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(conn_id = %session.conn_id, error = %e, "ws: invalid inbound frame");
            return vec![error_frame("Invalid message format")];
        }
    };
    let Some(msg_type) = raw.get("type").and_then(Value::as_str).map(str::to_string) else {
        return vec![error_frame("Invalid message format")];
    };

    let msg: ClientMessage = match serde_json::from_value(raw.clone()) {
        Ok(m) => m,
        Err(e) => {
            warn!(conn_id = %session.conn_id, %msg_type, error = %e, "ws: frame failed to parse");
            return if KNOWN_TYPES.contains(&msg_type.as_str()) {
                vec![error_frame("Invalid message format")]
            } else {
                vec![error_frame(format!("Unknown message type: {msg_type}"))]
            };
        }
    };

    let msg = match msg {
        ClientMessage::Auth { token, workspace, user_id, username } => {
            return handle_auth(state, session, token, workspace, user_id, username).await;
        }
        other => other,
    };

    // Every other frame requires an authenticated session.
    let Some(auth) = session.auth.clone() else {
        return vec![error_frame("Not authenticated")];
    };

    dispatch_authed(state, &auth, msg, &raw).await
}

async fn dispatch_authed(state: &AppState, auth: &AuthContext, msg: ClientMessage, raw: &Value) -> Vec<Value> {
    match msg {
        // Handled before dispatch; a second auth never reaches here.
        ClientMessage::Auth { .. } => Vec::new(),
        ClientMessage::RequestSharedState => handle_request_shared_state(state, auth).await,
        ClientMessage::RequestTeacherRole => handle_request_teacher_role(state, auth).await,
        ClientMessage::UpdateUsername { username } => handle_update_username(state, auth, username).await,
        ClientMessage::UpdateGlobalPermission { permission, value } => {
            handle_update_global_permission(state, auth, permission, value).await
        }
        ClientMessage::UpdateUserPermission { target_user_id, permission, value } => {
            handle_update_user_permission(state, auth, target_user_id, permission, value).await
        }
        ClientMessage::ApplyPresetMode { mode } => handle_apply_preset_mode(state, auth, mode).await,
        ClientMessage::RequestLock { element_id, element_type } => {
            handle_request_lock(state, auth, element_id, element_type).await
        }
        ClientMessage::ReleaseLock { element_id, final_position } => {
            handle_release_lock(state, auth, element_id, final_position).await
        }
        ClientMessage::UpdateCoords { x, y } => handle_update_coords(state, auth, x, y).await,
        ClientMessage::ElementDrag | ClientMessage::BlockFocus => {
            // Transient visuals: stamp the sender, no state write.
            broadcast_passthrough(state, auth, raw, true).await
        }
        ClientMessage::StackMove | ClientMessage::Action => {
            // Pass-through: rebroadcast unchanged.
            broadcast_passthrough(state, auth, raw, false).await
        }
        ClientMessage::BlockMove { block_id, element_id, position, if_match, etag } => {
            handle_block_move(state, auth, block_id.or(element_id), position, if_match, etag, raw).await
        }
        ClientMessage::SpriteUpdate { sprite_id, if_match, etag } => {
            handle_sprite_update(state, auth, sprite_id, if_match, etag, raw).await
        }
        ClientMessage::CreateElement {
            element_type,
            element_id,
            element_data,
            version,
            first_edited_by,
            first_edited_at,
            if_match,
            etag,
        } => {
            handle_create_element(
                state,
                auth,
                element_type,
                element_id,
                element_data,
                version,
                first_edited_by,
                first_edited_at,
                if_match,
                etag,
                raw,
            )
            .await
        }
        ClientMessage::DeleteElement { element_type, element_id, element_data, if_match, etag } => {
            handle_delete_element(state, auth, element_type, element_id, element_data, if_match, etag).await
        }
        ClientMessage::WorkspaceSnapshot { sprite_id, snapshot, if_match, etag } => {
            handle_workspace_snapshot(state, auth, sprite_id, snapshot, if_match, etag, raw).await
        }
    }
}

// =============================================================================
// ADMISSION
// =============================================================================

async fn handle_auth(
    state: &AppState,
    session: &mut ConnSession,
    token: Option<String>,
    workspace: Option<String>,
    user_id: Option<String>,
    username: Option<String>,
) -> Vec<Value> {
    if session.auth.is_some() {
        return vec![error_frame("Already authenticated")];
    }

    let claims = match admit(state, token.as_deref(), workspace.as_deref(), user_id.as_deref()) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(conn_id = %session.conn_id, reason = err.reason(), "ws: admission rejected");
            let _ = session
                .tx
                .try_send(Outbound::Close { code: CLOSE_REJECTED, reason: err.reason().to_string() });
            return vec![error_frame(err.to_string())];
        }
    };

    let role = Role::from_claim(claims.role.as_deref());
    let name = username
        .or(claims.username.clone())
        .unwrap_or_else(|| claims.sub.clone());
    let name = sanitize_username(&name).unwrap_or_else(|| claims.sub.clone());

    let outcome = workspace::attach_member(
        state,
        &claims.workspace_id,
        &claims.sub,
        name,
        role,
        session.conn_id,
        session.tx.clone(),
    )
    .await;

    session.auth = Some(AuthContext { workspace_id: claims.workspace_id.clone(), user_id: claims.sub.clone() });
    info!(
        conn_id = %session.conn_id,
        workspace_id = %claims.workspace_id,
        user_id = %claims.sub,
        role = role.as_str(),
        replaced = outcome.replaced,
        "ws: member authenticated"
    );

    vec![json!({
        "type": "auth_success",
        "userId": claims.sub,
        "workspaceId": claims.workspace_id,
        "permissions": outcome.permissions,
        "role": role.as_str(),
        "isOwner": outcome.is_owner,
        "sharedState": outcome.shared_state,
        "users": outcome.users,
    })]
}

/// Run the full admission pipeline: ticket presence, signature + claims,
/// frame/claim cross-checks, then single-use consumption.
fn admit(
    state: &AppState,
    token: Option<&str>,
    workspace: Option<&str>,
    user_id: Option<&str>,
) -> Result<Claims, AdmissionError> {
    let token = token.filter(|t| !t.is_empty()).ok_or(AdmissionError::Missing)?;
    let claims = state.verifier.verify(token)?;
    if workspace.is_some_and(|w| w != claims.workspace_id) {
        return Err(AdmissionError::WorkspaceMismatch);
    }
    if user_id.is_some_and(|u| u != claims.sub) {
        return Err(AdmissionError::UserMismatch);
    }
    state.tickets.consume(&claims)?;
    Ok(claims)
}

fn sanitize_username(name: &str) -> Option<String> {
    let trimmed: String = name.trim().chars().take(MAX_USERNAME_LEN).collect();
    (!trimmed.is_empty()).then_some(trimmed)
}

// =============================================================================
// WORKSPACE ACCESS
// =============================================================================

/// Run one command under the workspace's write guard. The closure performs
/// the whole mutation and queues its broadcasts; this is the single-writer
/// critical section.
async fn with_workspace<F>(state: &AppState, workspace_id: &str, f: F) -> Vec<Value>
where
    F: FnOnce(&mut WorkspaceState) -> Vec<Value>,
{
    let mut workspaces = state.workspaces.write().await;
    match workspaces.get_mut(workspace_id) {
        Some(ws) => f(ws),
        None => Vec::new(),
    }
}

fn effective_of(ws: &WorkspaceState, user_id: &str) -> PermissionSet {
    ws.members
        .get(user_id)
        .map(|m| permission::effective(&ws.permissions, m.role, user_id))
        .unwrap_or_default()
}

fn conflict_frame(conflict: &VersionConflict) -> Value {
    let mut frame = serde_json::to_value(conflict).unwrap_or_else(|_| json!({}));
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("type".into(), json!("conflict"));
        obj.insert("reason".into(), json!("etag_mismatch"));
    }
    frame
}

/// Clone the inbound payload for rebroadcast: strip the If-Match fields,
/// stamp the sender, and append fresh version metadata.
fn mutation_broadcast(raw: &Value, user_id: &str, kind: &str, id: &str, meta: &entity::EntityMeta) -> Value {
    let mut frame = raw.clone();
    if let Some(obj) = frame.as_object_mut() {
        obj.remove("ifMatch");
        obj.remove("etag");
        obj.insert("userId".into(), json!(user_id));
        obj.insert("etag".into(), json!(meta.etag(kind, id)));
        obj.insert("version".into(), json!(meta.version));
        obj.insert("firstEditedBy".into(), json!(meta.first_edited_by));
        obj.insert("firstEditedAt".into(), json!(meta.first_edited_at));
    }
    frame
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// =============================================================================
// PRESENCE AND SHARED STATE
// =============================================================================

async fn handle_request_shared_state(state: &AppState, auth: &AuthContext) -> Vec<Value> {
    let workspaces = state.workspaces.read().await;
    let Some(ws) = workspaces.get(&auth.workspace_id) else {
        return Vec::new();
    };
    vec![json!({ "type": "shared_state", "sharedState": workspace::shared_state_value(ws) })]
}

async fn handle_update_username(state: &AppState, auth: &AuthContext, username: Option<String>) -> Vec<Value> {
    let Some(name) = username.as_deref().and_then(sanitize_username) else {
        return vec![error_frame("username required")];
    };
    with_workspace(state, &auth.workspace_id, |ws| {
        let Some(member) = ws.members.get_mut(&auth.user_id) else {
            return Vec::new();
        };
        member.username = name;
        let member = &ws.members[&auth.user_id];
        let mut frame = workspace::user_payload(ws, member);
        if let Some(obj) = frame.as_object_mut() {
            obj.insert("type".into(), json!("user_updated"));
        }
        fan_out(ws, &auth.workspace_id, None, &frame);
        Vec::new()
    })
    .await
}

async fn handle_update_coords(state: &AppState, auth: &AuthContext, x: Option<f64>, y: Option<f64>) -> Vec<Value> {
    let (x, y) = (x.unwrap_or(0.0), y.unwrap_or(0.0));
    with_workspace(state, &auth.workspace_id, |ws| {
        if let Some(member) = ws.members.get_mut(&auth.user_id) {
            member.coords = Some(json!({ "x": x, "y": y }));
        }
        let frame = json!({ "type": "coords_update", "userId": auth.user_id, "x": x, "y": y });
        fan_out(ws, &auth.workspace_id, Some(&auth.user_id), &frame);
        Vec::new()
    })
    .await
}

/// Rebroadcast a frame to the rest of the workspace, optionally stamping the
/// sender's user id.
async fn broadcast_passthrough(state: &AppState, auth: &AuthContext, raw: &Value, stamp_sender: bool) -> Vec<Value> {
    let mut frame = raw.clone();
    if stamp_sender {
        if let Some(obj) = frame.as_object_mut() {
            obj.insert("userId".into(), json!(auth.user_id));
        }
    }
    workspace::broadcast(state, &auth.workspace_id, Some(&auth.user_id), &frame).await;
    Vec::new()
}

// =============================================================================
// PERMISSIONS
// =============================================================================

async fn handle_request_teacher_role(state: &AppState, auth: &AuthContext) -> Vec<Value> {
    with_workspace(state, &auth.workspace_id, |ws| {
        let Some(member) = ws.members.get(&auth.user_id) else {
            return Vec::new();
        };
        let role = member.role;
        match role {
            Role::Admin => permission::set_user_as_admin(&mut ws.permissions, &auth.user_id),
            Role::Teacher => permission::set_user_as_teacher(&mut ws.permissions, &auth.user_id),
            Role::Student | Role::Parent => {
                return vec![error_frame("Role escalation not permitted")];
            }
        }
        let effective = permission::effective(&ws.permissions, role, &auth.user_id);
        if let Some(member) = ws.members.get_mut(&auth.user_id) {
            member.permissions = effective;
        }

        let member = &ws.members[&auth.user_id];
        let mut frame = workspace::user_payload(ws, member);
        if let Some(obj) = frame.as_object_mut() {
            obj.insert("type".into(), json!("user_updated"));
        }
        fan_out(ws, &auth.workspace_id, Some(&auth.user_id), &frame);

        vec![json!({ "type": "permissions_updated", "permissions": effective })]
    })
    .await
}

async fn handle_update_global_permission(
    state: &AppState,
    auth: &AuthContext,
    permission_key: Option<String>,
    value: Option<bool>,
) -> Vec<Value> {
    with_workspace(state, &auth.workspace_id, |ws| {
        if !effective_of(ws, &auth.user_id).can_change_permissions {
            // Authorization failures on mutations are silent drops.
            return Vec::new();
        }
        let (Some(key), Some(value)) = (permission_key, value) else {
            return vec![error_frame("permission and value required")];
        };
        if !permission::update_global(&mut ws.permissions, &key, value) {
            return vec![error_frame(format!("unknown permission: {key}"))];
        }

        refresh_member_permissions(ws, &auth.workspace_id, true, |_| json!({}));
        Vec::new()
    })
    .await
}

async fn handle_update_user_permission(
    state: &AppState,
    auth: &AuthContext,
    target_user_id: Option<String>,
    permission_key: Option<String>,
    value: Option<bool>,
) -> Vec<Value> {
    with_workspace(state, &auth.workspace_id, |ws| {
        if !effective_of(ws, &auth.user_id).can_change_permissions {
            return Vec::new();
        }
        let Some(target) = non_empty(target_user_id) else {
            return vec![error_frame("targetUserId required")];
        };
        let (Some(key), Some(value)) = (permission_key, value) else {
            return vec![error_frame("permission and value required")];
        };
        if !permission::update_user(&mut ws.permissions, &target, &key, value) {
            return vec![error_frame(format!("unknown permission: {key}"))];
        }

        if ws.members.contains_key(&target) {
            let role = ws.members[&target].role;
            let effective = permission::effective(&ws.permissions, role, &target);
            if let Some(member) = ws.members.get_mut(&target) {
                member.permissions = effective;
                let _ = member.tx.try_send(Outbound::Frame(
                    json!({ "type": "permissions_updated", "permissions": effective }),
                ));
            }
            let member = &ws.members[&target];
            let mut frame = workspace::user_payload(ws, member);
            if let Some(obj) = frame.as_object_mut() {
                obj.insert("type".into(), json!("user_updated"));
            }
            fan_out(ws, &auth.workspace_id, None, &frame);
        }
        Vec::new()
    })
    .await
}

async fn handle_apply_preset_mode(state: &AppState, auth: &AuthContext, mode: Option<String>) -> Vec<Value> {
    with_workspace(state, &auth.workspace_id, |ws| {
        if !effective_of(ws, &auth.user_id).can_change_permissions {
            return Vec::new();
        }
        let Some(mode) = mode.as_deref().and_then(PresetMode::parse) else {
            return vec![error_frame("unknown preset mode")];
        };
        permission::apply_preset(&mut ws.permissions, mode);
        let preset = ws.permissions.global;

        refresh_member_permissions(ws, &auth.workspace_id, false, |_| {
            json!({ "source": "preset_update", "mode": mode.as_str(), "permissions": preset })
        });
        Vec::new()
    })
    .await
}

/// Recompute every member's effective set and push a `permissions_updated`
/// frame to each (with handler-specific extra fields). With `announce`, each
/// member's new state is also broadcast via `user_updated`.
fn refresh_member_permissions<F>(ws: &mut WorkspaceState, workspace_id: &str, announce: bool, extra: F)
where
    F: Fn(&str) -> Value,
{
    let user_ids: Vec<String> = ws.members.keys().cloned().collect();
    for user_id in &user_ids {
        let role = ws.members[user_id].role;
        let effective = permission::effective(&ws.permissions, role, user_id);
        if let Some(member) = ws.members.get_mut(user_id) {
            member.permissions = effective;
            let mut frame = json!({ "type": "permissions_updated", "permissions": effective });
            if let (Some(obj), Some(extra)) = (frame.as_object_mut(), extra(user_id).as_object()) {
                for (k, v) in extra {
                    obj.insert(k.clone(), v.clone());
                }
            }
            let _ = member.tx.try_send(Outbound::Frame(frame));
        }
    }
    if !announce {
        return;
    }
    for user_id in &user_ids {
        let member = &ws.members[user_id];
        let mut frame = workspace::user_payload(ws, member);
        if let Some(obj) = frame.as_object_mut() {
            obj.insert("type".into(), json!("user_updated"));
        }
        fan_out(ws, workspace_id, None, &frame);
    }
}

// =============================================================================
// LOCKS
// =============================================================================

async fn handle_request_lock(
    state: &AppState,
    auth: &AuthContext,
    element_id: Option<String>,
    element_type: Option<String>,
) -> Vec<Value> {
    let Some(element_id) = non_empty(element_id) else {
        return vec![error_frame("elementId required")];
    };
    with_workspace(state, &auth.workspace_id, |ws| {
        // Contention wins over permission: a lock held by someone else is
        // reported as such regardless of the requester's edit rights.
        if lock::held_by_other(&ws.locks, &element_id, &auth.user_id) {
            let holder = ws.locks[&element_id].holder.clone();
            return vec![json!({ "type": "lock_denied", "elementId": element_id, "lockedBy": holder })];
        }

        let effective = effective_of(ws, &auth.user_id);
        let allowed = match element_type.as_deref() {
            Some("sprite") => effective.can_edit_sprites,
            Some("variable") => effective.can_edit_variables,
            _ => effective.can_edit_blocks,
        };
        if !allowed {
            return vec![json!({
                "type": "lock_denied",
                "elementId": element_id,
                "lockedBy": Value::Null,
                "reason": "forbidden",
            })];
        }

        match lock::request(&mut ws.locks, &mut ws.lock_versions, &element_id, &auth.user_id) {
            LockDecision::Granted { version } => {
                let frame = json!({
                    "type": "element_locked",
                    "elementId": element_id,
                    "lockedBy": auth.user_id,
                    "version": version,
                });
                fan_out(ws, &auth.workspace_id, Some(&auth.user_id), &frame);
                vec![json!({ "type": "lock_granted", "elementId": element_id, "version": version })]
            }
            LockDecision::Denied { locked_by } => {
                vec![json!({ "type": "lock_denied", "elementId": element_id, "lockedBy": locked_by })]
            }
        }
    })
    .await
}

async fn handle_release_lock(
    state: &AppState,
    auth: &AuthContext,
    element_id: Option<String>,
    final_position: Option<Value>,
) -> Vec<Value> {
    let Some(element_id) = non_empty(element_id) else {
        return vec![error_frame("elementId required")];
    };
    with_workspace(state, &auth.workspace_id, |ws| {
        if lock::release(&mut ws.locks, &element_id, &auth.user_id) {
            let mut frame = json!({
                "type": "element_unlocked",
                "elementId": element_id,
                "userId": auth.user_id,
            });
            if let (Some(obj), Some(position)) = (frame.as_object_mut(), final_position) {
                obj.insert("finalPosition".into(), position);
            }
            fan_out(ws, &auth.workspace_id, Some(&auth.user_id), &frame);
        }
        Vec::new()
    })
    .await
}

// =============================================================================
// ENTITY MUTATIONS
// =============================================================================

async fn handle_block_move(
    state: &AppState,
    auth: &AuthContext,
    block_id: Option<String>,
    position: Option<Value>,
    if_match: Option<String>,
    etag: Option<String>,
    raw: &Value,
) -> Vec<Value> {
    let Some(block_id) = non_empty(block_id) else {
        return vec![error_frame("blockId required")];
    };
    with_workspace(state, &auth.workspace_id, |ws| {
        // Lock-holder discipline: routine contention, not an error.
        if lock::held_by_other(&ws.locks, &block_id, &auth.user_id) {
            return Vec::new();
        }
        // Stale writes conflict before the permission gate drops them, so
        // every client observes version divergence.
        if let Err(conflict) =
            entity::check_if_match(&ws.versions, KIND_BLOCK, &block_id, if_match_of(&if_match, &etag))
        {
            return vec![conflict_frame(&conflict)];
        }
        if !effective_of(ws, &auth.user_id).can_edit_blocks {
            return Vec::new();
        }

        let meta = entity::touch(&mut ws.versions, KIND_BLOCK, &block_id, &auth.user_id, now_ms());
        let record = ws
            .elements
            .entry(block_id.clone())
            .or_insert_with(|| ElementRecord { kind: KIND_BLOCK.into(), data: json!({}) });
        if let Some(position) = &position {
            if !record.data.is_object() {
                record.data = json!({});
            }
            if let Some(obj) = record.data.as_object_mut() {
                obj.insert("position".into(), position.clone());
            }
        }

        let frame = mutation_broadcast(raw, &auth.user_id, KIND_BLOCK, &block_id, &meta);
        fan_out(ws, &auth.workspace_id, None, &frame);
        Vec::new()
    })
    .await
}

async fn handle_sprite_update(
    state: &AppState,
    auth: &AuthContext,
    sprite_id: Option<String>,
    if_match: Option<String>,
    etag: Option<String>,
    raw: &Value,
) -> Vec<Value> {
    let Some(sprite_id) = non_empty(sprite_id) else {
        return vec![error_frame("spriteId required")];
    };
    with_workspace(state, &auth.workspace_id, |ws| {
        if lock::held_by_other(&ws.locks, &sprite_id, &auth.user_id) {
            return Vec::new();
        }
        if let Err(conflict) =
            entity::check_sprite_if_match(&ws.versions, &sprite_id, if_match_of(&if_match, &etag))
        {
            return vec![conflict_frame(&conflict)];
        }
        if !effective_of(ws, &auth.user_id).can_edit_sprites {
            return Vec::new();
        }

        let now = now_ms();
        entity::touch(&mut ws.versions, KIND_SPRITE, &sprite_id, &auth.user_id, now);
        let metrics_meta = entity::touch(&mut ws.versions, KIND_SPRITE_METRICS, &sprite_id, &auth.user_id, now);

        // Everything but the control fields is the sprite's metrics payload.
        let mut metrics = raw.clone();
        if let Some(obj) = metrics.as_object_mut() {
            obj.remove("type");
            obj.remove("spriteId");
            obj.remove("ifMatch");
            obj.remove("etag");
        }
        ws.sprite_metrics.insert(sprite_id.clone(), metrics.clone());

        let record = ws
            .elements
            .entry(sprite_id.clone())
            .or_insert_with(|| ElementRecord { kind: KIND_SPRITE.into(), data: json!({}) });
        if !record.data.is_object() {
            record.data = json!({});
        }
        if let (Some(target), Some(source)) = (record.data.as_object_mut(), metrics.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }

        let frame = mutation_broadcast(raw, &auth.user_id, KIND_SPRITE_METRICS, &sprite_id, &metrics_meta);
        fan_out(ws, &auth.workspace_id, None, &frame);
        Vec::new()
    })
    .await
}

#[allow(clippy::too_many_arguments)]
async fn handle_create_element(
    state: &AppState,
    auth: &AuthContext,
    element_type: Option<String>,
    element_id: Option<String>,
    element_data: Option<Value>,
    version: Option<u64>,
    first_edited_by: Option<String>,
    first_edited_at: Option<i64>,
    if_match: Option<String>,
    etag: Option<String>,
    raw: &Value,
) -> Vec<Value> {
    let kind = non_empty(element_type).unwrap_or_else(|| KIND_BLOCK.to_string());
    let resolved = entity::resolve_element_id(element_id.as_deref(), element_data.as_ref(), &kind);

    with_workspace(state, &auth.workspace_id, |ws| {
        let Some(id) = resolved else {
            // Legacy: no resolvable id — skip the shared-state write but
            // still announce the payload.
            let mut frame = raw.clone();
            if let Some(obj) = frame.as_object_mut() {
                obj.insert("type".into(), json!("element_created"));
                obj.insert("userId".into(), json!(auth.user_id));
            }
            fan_out(ws, &auth.workspace_id, None, &frame);
            return Vec::new();
        };

        if let Err(conflict) = entity::check_if_match(&ws.versions, &kind, &id, if_match_of(&if_match, &etag)) {
            return vec![conflict_frame(&conflict)];
        }

        let meta = entity::touch_restored(
            &mut ws.versions,
            &kind,
            &id,
            &auth.user_id,
            now_ms(),
            version,
            first_edited_by.as_deref(),
            first_edited_at,
        );
        let data = element_data.unwrap_or_else(|| json!({}));
        ws.elements.insert(id.clone(), ElementRecord { kind: kind.clone(), data: data.clone() });

        let frame = json!({
            "type": "element_created",
            "elementType": kind,
            "elementId": id,
            "elementData": data,
            "userId": auth.user_id,
            "etag": meta.etag(&kind, &id),
            "version": meta.version,
            "firstEditedBy": meta.first_edited_by,
            "firstEditedAt": meta.first_edited_at,
        });
        fan_out(ws, &auth.workspace_id, None, &frame);
        Vec::new()
    })
    .await
}

async fn handle_delete_element(
    state: &AppState,
    auth: &AuthContext,
    element_type: Option<String>,
    element_id: Option<String>,
    element_data: Option<Value>,
    if_match: Option<String>,
    etag: Option<String>,
) -> Vec<Value> {
    let kind = non_empty(element_type).unwrap_or_else(|| KIND_BLOCK.to_string());
    let resolved = entity::resolve_element_id(element_id.as_deref(), element_data.as_ref(), &kind);

    with_workspace(state, &auth.workspace_id, |ws| {
        let Some(id) = resolved else {
            let frame = json!({
                "type": "element_deleted",
                "elementType": kind,
                "userId": auth.user_id,
            });
            fan_out(ws, &auth.workspace_id, None, &frame);
            return Vec::new();
        };

        if let Err(conflict) = entity::check_if_match(&ws.versions, &kind, &id, if_match_of(&if_match, &etag)) {
            return vec![conflict_frame(&conflict)];
        }

        ws.elements.remove(&id);
        entity::remove(&mut ws.versions, &kind, &id);
        // Derived entities go with the element.
        ws.sprite_metrics.remove(&id);
        entity::remove(&mut ws.versions, KIND_SPRITE_METRICS, &id);
        ws.snapshots.remove(&id);
        entity::remove(&mut ws.versions, KIND_WORKSPACE_SNAPSHOT, &id);

        let frame = json!({
            "type": "element_deleted",
            "elementType": kind,
            "elementId": id,
            "userId": auth.user_id,
        });
        fan_out(ws, &auth.workspace_id, None, &frame);
        Vec::new()
    })
    .await
}

async fn handle_workspace_snapshot(
    state: &AppState,
    auth: &AuthContext,
    sprite_id: Option<String>,
    snapshot: Option<Value>,
    if_match: Option<String>,
    etag: Option<String>,
    raw: &Value,
) -> Vec<Value> {
    let Some(sprite_id) = non_empty(sprite_id) else {
        return vec![error_frame("spriteId required")];
    };
    with_workspace(state, &auth.workspace_id, |ws| {
        if !effective_of(ws, &auth.user_id).can_edit_blocks {
            return Vec::new();
        }

        let serialized = serde_json::to_string(&snapshot.unwrap_or(Value::Null)).unwrap_or_default();
        if serialized.chars().count() > MAX_SNAPSHOT_CHARS {
            return vec![error_frame("Workspace snapshot too large")];
        }

        if let Err(conflict) = entity::check_if_match(
            &ws.versions,
            KIND_WORKSPACE_SNAPSHOT,
            &sprite_id,
            if_match_of(&if_match, &etag),
        ) {
            return vec![conflict_frame(&conflict)];
        }

        let meta = entity::touch(&mut ws.versions, KIND_WORKSPACE_SNAPSHOT, &sprite_id, &auth.user_id, now_ms());
        ws.snapshots.insert(sprite_id.clone(), serialized);

        let frame = mutation_broadcast(raw, &auth.user_id, KIND_WORKSPACE_SNAPSHOT, &sprite_id, &meta);
        fan_out(ws, &auth.workspace_id, None, &frame);
        Vec::new()
    })
    .await
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
