use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shapewatch_config::{Mode, OverlayCache, set_note, set_status};
use shapewatch_core::{ItemKind, ItemStatus, ManualClock, build_markdown};
use shapewatch_store::{DEFAULT_IGNORED_SCOPE, KeySetStore, SEED_SCOPE, StatusStore};
use tempfile::tempdir;

#[test]
fn second_run_seeds_registry_from_known_keys_as_accepted()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let dir = temp.path();

    let mut keysets = KeySetStore::open(dir.join("known_keys.json"), dir.join("known_keys.md"));
    keysets.record_update_keys(["poll"]);
    keysets.record_message_keys(["poll"]);
    assert!(keysets.record_entity_type("spoiler"));
    assert_eq!(
        keysets.record_api_shape("getUpdates", &json!([{"update_id": 1}])),
        vec!["[array]", "item.update_id"]
    );
    drop(keysets);

    let keysets = KeySetStore::open(dir.join("known_keys.json"), dir.join("known_keys.md"));
    assert!(keysets.loaded_from_disk());

    let statuses = StatusStore::open(
        dir.join("registry.json"),
        OverlayCache::new(dir.join("overlay.json")),
        Arc::new(ManualClock::new()),
        Duration::from_millis(100),
        Some(&keysets),
    );

    assert_eq!(statuses.get_scope_status("poll"), Some(ItemStatus::Process));
    assert_eq!(statuses.get_scope_status("update_id"), None);
    assert_eq!(
        statuses.get_message_key_status(SEED_SCOPE, "poll"),
        Some(ItemStatus::Process)
    );
    assert_eq!(
        statuses.get_entity_type_status(SEED_SCOPE, "spoiler"),
        Some(ItemStatus::Process)
    );
    assert_eq!(
        statuses.get_scope_status(DEFAULT_IGNORED_SCOPE),
        Some(ItemStatus::Ignore)
    );

    let raw = fs::read_to_string(dir.join("registry.json"))?;
    let saved: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(saved["scopes"]["poll"]["status"], "process");
    assert_eq!(saved["version"], 1);

    Ok(())
}

#[test]
fn overlay_edits_show_up_without_restart() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let dir = temp.path();
    let overlay = dir.join("overlay.json");
    fs::write(&overlay, r#"{"mode":"prod"}"#)?;

    let mut statuses = StatusStore::open(
        dir.join("registry.json"),
        OverlayCache::new(&overlay),
        Arc::new(ManualClock::new()),
        Duration::from_millis(100),
        None,
    );
    assert_eq!(statuses.get_mode(), Mode::Prod);

    statuses.observe_scopes(["album"]);
    assert_eq!(statuses.get_scope_status("album"), Some(ItemStatus::NeedsReview));

    set_status(&overlay, ItemKind::Scope, "album", None, ItemStatus::Ignore)?;
    set_note(&overlay, ItemKind::Scope, "album", None, Some("grouped media, handled upstream"))?;
    // Make sure the rewrite is seen as a new version even on coarse-mtime filesystems.
    let bumped = fs::metadata(&overlay)?.modified()? + Duration::from_secs(2);
    fs::File::options().write(true).open(&overlay)?.set_modified(bumped)?;

    assert_eq!(statuses.get_scope_status("album"), Some(ItemStatus::Ignore));
    assert_eq!(statuses.get_mode(), Mode::Prod);

    statuses.observe_scopes(["album"]);
    let report = build_markdown(&statuses.snapshot());
    assert!(report.contains("- `album` seen=2 (grouped media, handled upstream)"));
    assert_eq!(report, build_markdown(&statuses.snapshot()));

    Ok(())
}
