//! Permission resolver — roles, templates, presets, per-user overrides.
//!
//! DESIGN
//! ======
//! Effective permissions are derived, never stored durably per connection:
//! role ADMIN short-circuits to the admin template, role TEACHER without an
//! override resolves to the teacher template, an override wins next, and the
//! workspace global set is the fallback. Presets and single-key mutations
//! *replace* the global set against template defaults; they never merge with
//! the previous value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// ROLES
// =============================================================================

/// Platform-asserted role carried by the join ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    /// Parse a role claim; unknown or absent values default to STUDENT.
    #[must_use]
    pub fn from_claim(value: Option<&str>) -> Self {
        match value {
            Some("ADMIN") => Self::Admin,
            Some("TEACHER") => Self::Teacher,
            Some("PARENT") => Self::Parent,
            _ => Self::Student,
        }
    }

    /// Wire representation, e.g. `"ADMIN"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Teacher => "TEACHER",
            Self::Student => "STUDENT",
            Self::Parent => "PARENT",
        }
    }
}

// =============================================================================
// PERMISSION SET
// =============================================================================

/// Total mapping over the closed set of 24 permission keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSet {
    pub can_view: bool,
    pub can_edit_blocks: bool,
    pub can_add_blocks: bool,
    pub can_delete_blocks: bool,
    pub can_edit_sprites: bool,
    pub can_add_sprites: bool,
    pub can_delete_sprites: bool,
    pub can_edit_variables: bool,
    pub can_add_variables: bool,
    pub can_delete_variables: bool,
    pub can_run_code: bool,
    pub can_stop_code: bool,
    pub can_chat: bool,
    pub can_draw: bool,
    pub can_upload_assets: bool,
    pub can_edit_costumes: bool,
    pub can_edit_sounds: bool,
    pub can_record_audio: bool,
    pub can_use_camera: bool,
    pub can_share_project: bool,
    pub can_manage_users: bool,
    pub can_change_permissions: bool,
    pub can_kick_users: bool,
    pub can_lock_workspace: bool,
}

impl PermissionSet {
    /// OWNER/ADMIN template: every permission granted.
    #[must_use]
    pub fn admin() -> Self {
        Self {
            can_view: true,
            can_edit_blocks: true,
            can_add_blocks: true,
            can_delete_blocks: true,
            can_edit_sprites: true,
            can_add_sprites: true,
            can_delete_sprites: true,
            can_edit_variables: true,
            can_add_variables: true,
            can_delete_variables: true,
            can_run_code: true,
            can_stop_code: true,
            can_chat: true,
            can_draw: true,
            can_upload_assets: true,
            can_edit_costumes: true,
            can_edit_sounds: true,
            can_record_audio: true,
            can_use_camera: true,
            can_share_project: true,
            can_manage_users: true,
            can_change_permissions: true,
            can_kick_users: true,
            can_lock_workspace: true,
        }
    }

    /// TEACHER template: full edit + user management, but no workspace lock
    /// or project sharing.
    #[must_use]
    pub fn teacher() -> Self {
        Self {
            can_share_project: false,
            can_lock_workspace: false,
            ..Self::admin()
        }
    }

    /// STUDENT template: view and chat only.
    #[must_use]
    pub fn student() -> Self {
        Self { can_view: true, can_chat: true, ..Self::default() }
    }

    /// Read a permission by wire key. Returns `None` for unknown keys.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<bool> {
        Some(match key {
            "canView" => self.can_view,
            "canEditBlocks" => self.can_edit_blocks,
            "canAddBlocks" => self.can_add_blocks,
            "canDeleteBlocks" => self.can_delete_blocks,
            "canEditSprites" => self.can_edit_sprites,
            "canAddSprites" => self.can_add_sprites,
            "canDeleteSprites" => self.can_delete_sprites,
            "canEditVariables" => self.can_edit_variables,
            "canAddVariables" => self.can_add_variables,
            "canDeleteVariables" => self.can_delete_variables,
            "canRunCode" => self.can_run_code,
            "canStopCode" => self.can_stop_code,
            "canChat" => self.can_chat,
            "canDraw" => self.can_draw,
            "canUploadAssets" => self.can_upload_assets,
            "canEditCostumes" => self.can_edit_costumes,
            "canEditSounds" => self.can_edit_sounds,
            "canRecordAudio" => self.can_record_audio,
            "canUseCamera" => self.can_use_camera,
            "canShareProject" => self.can_share_project,
            "canManageUsers" => self.can_manage_users,
            "canChangePermissions" => self.can_change_permissions,
            "canKickUsers" => self.can_kick_users,
            "canLockWorkspace" => self.can_lock_workspace,
            _ => return None,
        })
    }

    /// Write a permission by wire key. Returns `false` for unknown keys.
    pub fn set(&mut self, key: &str, value: bool) -> bool {
        let slot = match key {
            "canView" => &mut self.can_view,
            "canEditBlocks" => &mut self.can_edit_blocks,
            "canAddBlocks" => &mut self.can_add_blocks,
            "canDeleteBlocks" => &mut self.can_delete_blocks,
            "canEditSprites" => &mut self.can_edit_sprites,
            "canAddSprites" => &mut self.can_add_sprites,
            "canDeleteSprites" => &mut self.can_delete_sprites,
            "canEditVariables" => &mut self.can_edit_variables,
            "canAddVariables" => &mut self.can_add_variables,
            "canDeleteVariables" => &mut self.can_delete_variables,
            "canRunCode" => &mut self.can_run_code,
            "canStopCode" => &mut self.can_stop_code,
            "canChat" => &mut self.can_chat,
            "canDraw" => &mut self.can_draw,
            "canUploadAssets" => &mut self.can_upload_assets,
            "canEditCostumes" => &mut self.can_edit_costumes,
            "canEditSounds" => &mut self.can_edit_sounds,
            "canRecordAudio" => &mut self.can_record_audio,
            "canUseCamera" => &mut self.can_use_camera,
            "canShareProject" => &mut self.can_share_project,
            "canManageUsers" => &mut self.can_manage_users,
            "canChangePermissions" => &mut self.can_change_permissions,
            "canKickUsers" => &mut self.can_kick_users,
            "canLockWorkspace" => &mut self.can_lock_workspace,
            _ => return false,
        };
        *slot = value;
        true
    }
}

// =============================================================================
// PRESET MODES
// =============================================================================

/// Named full replacements of the workspace global permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetMode {
    Presentation,
    Work,
    Test,
    Restricted,
}

impl PresetMode {
    /// Parse a preset name from the wire.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "presentation" => Some(Self::Presentation),
            "work" => Some(Self::Work),
            "test" => Some(Self::Test),
            "restricted" => Some(Self::Restricted),
            _ => None,
        }
    }

    /// Wire representation, e.g. `"presentation"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Presentation => "presentation",
            Self::Work => "work",
            Self::Test => "test",
            Self::Restricted => "restricted",
        }
    }

    /// The permission set this preset replaces the global set with.
    #[must_use]
    pub fn template(self) -> PermissionSet {
        match self {
            Self::Presentation | Self::Restricted => {
                PermissionSet { can_view: true, ..PermissionSet::default() }
            }
            Self::Work => PermissionSet {
                can_view: true,
                can_edit_blocks: true,
                can_add_blocks: true,
                can_edit_sprites: true,
                can_run_code: true,
                can_chat: true,
                ..PermissionSet::default()
            },
            Self::Test => {
                PermissionSet { can_view: true, can_run_code: true, ..PermissionSet::default() }
            }
        }
    }
}

// =============================================================================
// WORKSPACE PERMISSION STATE
// =============================================================================

/// Per-workspace permission state: the global default, per-user overrides,
/// and the last applied preset marker.
#[derive(Debug, Clone)]
pub struct WorkspacePermissions {
    pub global: PermissionSet,
    pub overrides: HashMap<String, PermissionSet>,
    pub preset_mode: Option<PresetMode>,
}

impl WorkspacePermissions {
    /// Fresh workspaces start with STUDENT globals.
    #[must_use]
    pub fn new() -> Self {
        Self { global: PermissionSet::student(), overrides: HashMap::new(), preset_mode: None }
    }
}

impl Default for WorkspacePermissions {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Compute the effective permission set for a user.
#[must_use]
pub fn effective(perms: &WorkspacePermissions, role: Role, user_id: &str) -> PermissionSet {
    if role == Role::Admin {
        return PermissionSet::admin();
    }
    if role == Role::Teacher && !perms.overrides.contains_key(user_id) {
        return PermissionSet::teacher();
    }
    if let Some(override_set) = perms.overrides.get(user_id) {
        return *override_set;
    }
    perms.global
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// Set one key on the global set. Returns `false` for unknown keys.
pub fn update_global(perms: &mut WorkspacePermissions, key: &str, value: bool) -> bool {
    perms.global.set(key, value)
}

/// Set one key on a user's override, lazily initialising the override from a
/// copy of the current global set. Returns `false` for unknown keys.
pub fn update_user(perms: &mut WorkspacePermissions, user_id: &str, key: &str, value: bool) -> bool {
    let global = perms.global;
    perms
        .overrides
        .entry(user_id.to_string())
        .or_insert(global)
        .set(key, value)
}

/// Pin a user to the ADMIN template.
pub fn set_user_as_admin(perms: &mut WorkspacePermissions, user_id: &str) {
    perms.overrides.insert(user_id.to_string(), PermissionSet::admin());
}

/// Pin a user to the TEACHER template.
pub fn set_user_as_teacher(perms: &mut WorkspacePermissions, user_id: &str) {
    perms.overrides.insert(user_id.to_string(), PermissionSet::teacher());
}

/// Drop a user's override so they fall back to role/global resolution.
pub fn clear_user(perms: &mut WorkspacePermissions, user_id: &str) {
    perms.overrides.remove(user_id);
}

/// Replace the global set with a preset template and record the mode marker.
pub fn apply_preset(perms: &mut WorkspacePermissions, mode: PresetMode) {
    perms.global = mode.template();
    perms.preset_mode = Some(mode);
}

#[cfg(test)]
#[path = "permission_test.rs"]
mod tests;
