//! Entity versioning — monotonic versions, weak ETags, If-Match gating.
//!
//! DESIGN
//! ======
//! Every shared entity is keyed `(kind, id)` and carries a monotonic version
//! plus sticky first-edited metadata. The derived weak ETag
//! `W/"<kind>:<id>:<version>"` is what clients echo back as `ifMatch`; a
//! missing value or the literal `"*"` always passes, and a concrete value is
//! checked only when the entity currently exists (a deleted entity restarts
//! at version 1 on re-creation).

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// Entity kind wire strings. Kinds are open-ended on the element side
/// (`block`, `sprite`, `variable`, ...); the two derived kinds are fixed.
pub const KIND_BLOCK: &str = "block";
pub const KIND_SPRITE: &str = "sprite";
pub const KIND_SPRITE_METRICS: &str = "sprite-metrics";
pub const KIND_WORKSPACE_SNAPSHOT: &str = "workspace-snapshot";

/// Version map key: `(kind, element id)`.
pub type EntityKey = (String, String);

// =============================================================================
// METADATA
// =============================================================================

/// Version metadata tracked per entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    pub version: u64,
    /// Sticky for the entity's lifetime in RAM.
    pub first_edited_by: String,
    pub first_edited_at: i64,
    pub updated_by: String,
    pub updated_at: i64,
}

/// Render the weak ETag for an entity version.
#[must_use]
pub fn etag(kind: &str, id: &str, version: u64) -> String {
    format!("W/\"{kind}:{id}:{version}\"")
}

impl EntityMeta {
    /// The ETag derived from this metadata.
    #[must_use]
    pub fn etag(&self, kind: &str, id: &str) -> String {
        etag(kind, id, self.version)
    }
}

// =============================================================================
// IF-MATCH
// =============================================================================

/// Detail carried by a `conflict` frame when an If-Match check fails.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionConflict {
    pub entity_type: String,
    pub entity_id: String,
    pub if_match: Option<String>,
    pub current_etag: String,
    pub first_edited_by: String,
    pub first_edited_at: i64,
}

/// Check a submitted If-Match value against the current entity state.
///
/// # Errors
///
/// Returns the [`VersionConflict`] to surface to the sender when a concrete
/// value does not equal the entity's current ETag.
pub fn check_if_match(
    versions: &HashMap<EntityKey, EntityMeta>,
    kind: &str,
    id: &str,
    provided: Option<&str>,
) -> Result<(), VersionConflict> {
    let Some(meta) = versions.get(&(kind.to_string(), id.to_string())) else {
        // No live entity: any If-Match is satisfied.
        return Ok(());
    };
    match provided {
        None | Some("*") => Ok(()),
        Some(value) if value == meta.etag(kind, id) => Ok(()),
        Some(value) => Err(VersionConflict {
            entity_type: kind.to_string(),
            entity_id: id.to_string(),
            if_match: Some(value.to_string()),
            current_etag: meta.etag(kind, id),
            first_edited_by: meta.first_edited_by.clone(),
            first_edited_at: meta.first_edited_at,
        }),
    }
}

/// Sprite mutations are gated against both the sprite element and its derived
/// metrics entity; a concrete If-Match passes if it equals either current
/// ETag.
///
/// # Errors
///
/// Returns a conflict describing the metrics entity (or the sprite element
/// when only that exists).
pub fn check_sprite_if_match(
    versions: &HashMap<EntityKey, EntityMeta>,
    id: &str,
    provided: Option<&str>,
) -> Result<(), VersionConflict> {
    let sprite = check_if_match(versions, KIND_SPRITE, id, provided);
    let metrics = check_if_match(versions, KIND_SPRITE_METRICS, id, provided);
    match (sprite, metrics) {
        (Ok(()), _) | (_, Ok(())) => Ok(()),
        (Err(_), Err(metrics_conflict)) => Err(metrics_conflict),
    }
}

// =============================================================================
// MUTATION
// =============================================================================

/// Bump an entity's version, creating it at version 1 with fresh
/// first-edited metadata when absent. Returns the updated metadata.
pub fn touch(
    versions: &mut HashMap<EntityKey, EntityMeta>,
    kind: &str,
    id: &str,
    user_id: &str,
    now: i64,
) -> EntityMeta {
    let meta = versions
        .entry((kind.to_string(), id.to_string()))
        .and_modify(|m| {
            m.version += 1;
            m.updated_by = user_id.to_string();
            m.updated_at = now;
        })
        .or_insert_with(|| EntityMeta {
            version: 1,
            first_edited_by: user_id.to_string(),
            first_edited_at: now,
            updated_by: user_id.to_string(),
            updated_at: now,
        });
    meta.clone()
}

/// Seed a fresh entity with restored metadata (shared-state re-import). Used
/// only when the entity does not yet exist; otherwise behaves like [`touch`].
pub fn touch_restored(
    versions: &mut HashMap<EntityKey, EntityMeta>,
    kind: &str,
    id: &str,
    user_id: &str,
    now: i64,
    version: Option<u64>,
    first_edited_by: Option<&str>,
    first_edited_at: Option<i64>,
) -> EntityMeta {
    let key = (kind.to_string(), id.to_string());
    if versions.contains_key(&key) {
        return touch(versions, kind, id, user_id, now);
    }
    let meta = EntityMeta {
        version: version.unwrap_or(1).max(1),
        first_edited_by: first_edited_by.unwrap_or(user_id).to_string(),
        first_edited_at: first_edited_at.unwrap_or(now),
        updated_by: user_id.to_string(),
        updated_at: now,
    };
    versions.insert(key, meta.clone());
    meta
}

/// Remove an entity's version entry.
pub fn remove(versions: &mut HashMap<EntityKey, EntityMeta>, kind: &str, id: &str) {
    versions.remove(&(kind.to_string(), id.to_string()));
}

// =============================================================================
// ELEMENT-ID RESOLUTION
// =============================================================================

/// Resolve the element id for `create_element`/`delete_element`: an explicit
/// `elementId` wins, then the payload keys `id`, `elementId`, `spriteId`,
/// `blockId`, `variableId`; sprites additionally fall back to `name`.
#[must_use]
pub fn resolve_element_id(
    element_id: Option<&str>,
    payload: Option<&Value>,
    element_type: &str,
) -> Option<String> {
    if let Some(id) = non_empty(element_id) {
        return Some(id);
    }
    let payload = payload?;
    for key in ["id", "elementId", "spriteId", "blockId", "variableId"] {
        if let Some(id) = non_empty(payload.get(key).and_then(Value::as_str)) {
            return Some(id);
        }
    }
    if element_type == KIND_SPRITE {
        if let Some(id) = non_empty(payload.get("name").and_then(Value::as_str)) {
            return Some(id);
        }
    }
    None
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

// =============================================================================
// TESTS
// =============================================================================
