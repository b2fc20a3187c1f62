use super::*;

#[test]
fn admin_template_grants_everything() {
    let set = PermissionSet::admin();
    assert!(set.can_view);
    assert!(set.can_lock_workspace);
    assert!(set.can_share_project);
    assert!(set.can_change_permissions);
}

#[test]
fn teacher_template_withholds_lock_and_share() {
    let set = PermissionSet::teacher();
    assert!(set.can_edit_blocks);
    assert!(set.can_manage_users);
    assert!(set.can_change_permissions);
    assert!(!set.can_lock_workspace);
    assert!(!set.can_share_project);
}

#[test]
fn student_template_is_view_and_chat_only() {
    let set = PermissionSet::student();
    assert!(set.can_view);
    assert!(set.can_chat);
    assert!(!set.can_edit_blocks);
    assert!(!set.can_run_code);
    assert!(!set.can_change_permissions);
}

#[test]
fn permission_set_serializes_camel_case() {
    let json = serde_json::to_value(PermissionSet::student()).unwrap();
    assert_eq!(json["canView"], true);
    assert_eq!(json["canChat"], true);
    assert_eq!(json["canEditBlocks"], false);
    // All 24 keys must be present in the wire form.
    assert_eq!(json.as_object().unwrap().len(), 24);
}

#[test]
fn get_and_set_cover_every_wire_key() {
    const KEYS: [&str; 24] = [
        "canView",
        "canEditBlocks",
        "canAddBlocks",
        "canDeleteBlocks",
        "canEditSprites",
        "canAddSprites",
        "canDeleteSprites",
        "canEditVariables",
        "canAddVariables",
        "canDeleteVariables",
        "canRunCode",
        "canStopCode",
        "canChat",
        "canDraw",
        "canUploadAssets",
        "canEditCostumes",
        "canEditSounds",
        "canRecordAudio",
        "canUseCamera",
        "canShareProject",
        "canManageUsers",
        "canChangePermissions",
        "canKickUsers",
        "canLockWorkspace",
    ];

    let mut set = PermissionSet::default();
    for key in KEYS {
        assert_eq!(set.get(key), Some(false), "missing key {key}");
        assert!(set.set(key, true), "set failed for {key}");
        assert_eq!(set.get(key), Some(true), "set did not stick for {key}");
    }
    assert_eq!(set, PermissionSet::admin());

    assert_eq!(set.get("canFly"), None);
    assert!(!set.set("canFly", true));
}

#[test]
fn role_claim_parsing_defaults_to_student() {
    assert_eq!(Role::from_claim(Some("ADMIN")), Role::Admin);
    assert_eq!(Role::from_claim(Some("TEACHER")), Role::Teacher);
    assert_eq!(Role::from_claim(Some("PARENT")), Role::Parent);
    assert_eq!(Role::from_claim(Some("STUDENT")), Role::Student);
    assert_eq!(Role::from_claim(Some("wizard")), Role::Student);
    assert_eq!(Role::from_claim(None), Role::Student);
}

#[test]
fn effective_admin_role_short_circuits() {
    let mut perms = WorkspacePermissions::new();
    // Even an explicit restrictive override loses to the ADMIN role.
    perms.overrides.insert("u1".into(), PermissionSet::default());
    assert_eq!(effective(&perms, Role::Admin, "u1"), PermissionSet::admin());
}

#[test]
fn effective_teacher_without_override_gets_template() {
    let perms = WorkspacePermissions::new();
    assert_eq!(effective(&perms, Role::Teacher, "t1"), PermissionSet::teacher());
}

#[test]
fn effective_teacher_with_override_gets_override() {
    let mut perms = WorkspacePermissions::new();
    let mut restricted = PermissionSet::default();
    restricted.can_view = true;
    perms.overrides.insert("t1".into(), restricted);
    assert_eq!(effective(&perms, Role::Teacher, "t1"), restricted);
}

#[test]
fn effective_student_falls_back_to_global() {
    let mut perms = WorkspacePermissions::new();
    assert_eq!(effective(&perms, Role::Student, "s1"), PermissionSet::student());

    update_global(&mut perms, "canEditBlocks", true);
    assert!(effective(&perms, Role::Student, "s1").can_edit_blocks);
}

#[test]
fn update_user_copies_current_global_lazily() {
    let mut perms = WorkspacePermissions::new();
    update_global(&mut perms, "canDraw", true);

    assert!(update_user(&mut perms, "s1", "canRunCode", true));
    let eff = effective(&perms, Role::Student, "s1");
    // The override started from the global snapshot (canDraw carried over).
    assert!(eff.can_draw);
    assert!(eff.can_run_code);

    // Later global changes no longer affect the overridden user.
    update_global(&mut perms, "canDraw", false);
    assert!(effective(&perms, Role::Student, "s1").can_draw);
    assert!(!effective(&perms, Role::Student, "s2").can_draw);
}

#[test]
fn clear_user_restores_global_resolution() {
    let mut perms = WorkspacePermissions::new();
    update_user(&mut perms, "s1", "canRunCode", true);
    assert!(effective(&perms, Role::Student, "s1").can_run_code);

    clear_user(&mut perms, "s1");
    assert!(!effective(&perms, Role::Student, "s1").can_run_code);
}

#[test]
fn preset_replaces_global_instead_of_merging() {
    let mut perms = WorkspacePermissions::new();
    update_global(&mut perms, "canEditBlocks", true);
    update_global(&mut perms, "canChat", true);

    apply_preset(&mut perms, PresetMode::Presentation);
    let global = perms.global;
    assert!(global.can_view);
    assert!(!global.can_chat);
    assert!(!global.can_edit_blocks);
    assert_eq!(perms.preset_mode, Some(PresetMode::Presentation));

    // Subsequent single-key updates apply to the new baseline.
    update_global(&mut perms, "canChat", true);
    assert!(perms.global.can_chat);
    assert!(!perms.global.can_edit_blocks);
}

#[test]
fn preset_templates_match_the_mode_definitions() {
    let presentation = PresetMode::Presentation.template();
    assert!(presentation.can_view);
    assert!(!presentation.can_chat);

    let work = PresetMode::Work.template();
    assert!(work.can_view);
    assert!(work.can_edit_blocks);
    assert!(work.can_add_blocks);
    assert!(work.can_edit_sprites);
    assert!(work.can_run_code);
    assert!(work.can_chat);
    assert!(!work.can_delete_blocks);

    let test = PresetMode::Test.template();
    assert!(test.can_view);
    assert!(test.can_run_code);
    assert!(!test.can_chat);

    assert_eq!(PresetMode::Restricted.template(), presentation);
}

#[test]
fn preset_parse_round_trips() {
    for mode in [PresetMode::Presentation, PresetMode::Work, PresetMode::Test, PresetMode::Restricted] {
        assert_eq!(PresetMode::parse(mode.as_str()), Some(mode));
    }
    assert_eq!(PresetMode::parse("party"), None);
}
