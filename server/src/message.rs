//! Wire protocol — inbound message model and outbound frame helpers.
//!
//! ARCHITECTURE
//! ============
//! Every frame on the socket is a JSON object with a string `type`
//! discriminator. Inbound frames deserialize into [`ClientMessage`], a tagged
//! union with one variant per message kind and per-field optionality
//! preserved; the raw `serde_json::Value` is kept alongside so pass-through
//! kinds (`stack_move`, `action`, drags) can be rebroadcast without reshaping.
//!
//! DESIGN
//! ======
//! - Tags are snake_case (`request_lock`), fields camelCase (`elementId`).
//! - `ifMatch` and its legacy alias `etag` are separate optional fields;
//!   [`if_match_of`] picks whichever is present.
//! - Outbound frames are built with `serde_json::json!` at the call site;
//!   only the error frame and close codes live here because every handler
//!   needs them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::Value;

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Application close code sent to a connection replaced by a reconnect.
pub const CLOSE_REPLACED: u16 = 4001;

/// Application close code for a rejected admission.
pub const CLOSE_REJECTED: u16 = 4003;

/// Close reason attached to [`CLOSE_REPLACED`].
pub const REPLACED_REASON: &str = "Reconnected with same userId";

// =============================================================================
// INBOUND MESSAGES
// =============================================================================

/// Inbound frame taxonomy, discriminated on the `type` field.
///
/// Variants without fields are pass-through or transient kinds whose payload
/// is read from the raw JSON value at dispatch time.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Auth {
        token: Option<String>,
        workspace: Option<String>,
        user_id: Option<String>,
        username: Option<String>,
    },
    RequestSharedState,
    RequestTeacherRole,
    UpdateUsername {
        username: Option<String>,
    },
    UpdateGlobalPermission {
        permission: Option<String>,
        value: Option<bool>,
    },
    UpdateUserPermission {
        target_user_id: Option<String>,
        permission: Option<String>,
        value: Option<bool>,
    },
    ApplyPresetMode {
        mode: Option<String>,
    },
    RequestLock {
        element_id: Option<String>,
        element_type: Option<String>,
    },
    ReleaseLock {
        element_id: Option<String>,
        final_position: Option<Value>,
    },
    UpdateCoords {
        x: Option<f64>,
        y: Option<f64>,
    },
    ElementDrag,
    BlockMove {
        block_id: Option<String>,
        element_id: Option<String>,
        position: Option<Value>,
        if_match: Option<String>,
        etag: Option<String>,
    },
    BlockFocus,
    SpriteUpdate {
        sprite_id: Option<String>,
        if_match: Option<String>,
        etag: Option<String>,
    },
    StackMove,
    Action,
    CreateElement {
        element_type: Option<String>,
        element_id: Option<String>,
        element_data: Option<Value>,
        version: Option<u64>,
        first_edited_by: Option<String>,
        first_edited_at: Option<i64>,
        if_match: Option<String>,
        etag: Option<String>,
    },
    DeleteElement {
        element_type: Option<String>,
        element_id: Option<String>,
        element_data: Option<Value>,
        if_match: Option<String>,
        etag: Option<String>,
    },
    WorkspaceSnapshot {
        sprite_id: Option<String>,
        snapshot: Option<Value>,
        if_match: Option<String>,
        etag: Option<String>,
    },
}

/// Pick the effective If-Match value from the `ifMatch` field or its legacy
/// `etag` alias.
#[must_use]
pub fn if_match_of<'a>(if_match: &'a Option<String>, etag: &'a Option<String>) -> Option<&'a str> {
    if_match.as_deref().or(etag.as_deref())
}

// =============================================================================
// OUTBOUND HELPERS
// =============================================================================

/// Build an `error` frame with a human-readable message.
#[must_use]
pub fn error_frame(message: impl Into<String>) -> Value {
    serde_json::json!({ "type": "error", "message": message.into() })
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// TESTS
// =============================================================================
