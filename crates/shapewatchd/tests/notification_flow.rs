use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use shapewatch_config::{Mode, ShapewatchConfig, set_mode, storage_paths};
use shapewatch_core::{ItemStatus, ManualClock};
use shapewatchd::ingest::{JsonLinesSink, Observation, ShapeRegistry};
use tempfile::tempdir;

fn scopes_observation(channel: &str, scopes: &[&str], context: Value) -> Observation {
    Observation {
        channel: Some(channel.to_owned()),
        scopes: scopes.iter().map(|scope| (*scope).to_owned()).collect(),
        context,
        ..Observation::default()
    }
}

fn delivered_lines(output: Vec<u8>) -> Vec<Value> {
    String::from_utf8(output)
        .expect("utf8 output")
        .lines()
        .map(|line| serde_json::from_str(line).expect("delivery json"))
        .collect()
}

#[test]
fn burst_of_observations_becomes_one_report_per_chat() {
    let temp = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new());
    let config = ShapewatchConfig::default();
    let window = Duration::from_millis(config.timing.notify_debounce_ms);

    let mut registry = ShapeRegistry::open(
        temp.path(),
        &config,
        clock.clone(),
        JsonLinesSink::new(Vec::new()),
    );

    registry.observe(scopes_observation("chat-a", &["scopeB"], json!({"n": 1})));
    clock.advance(window / 2);
    registry.observe(scopes_observation("chat-a", &["scopeA"], json!({"n": 2})));
    registry.observe(scopes_observation("chat-b", &["scopeC"], json!({"n": 3})));

    // The second observation restarted chat-a's window.
    clock.advance(window / 2);
    registry.tick();
    assert!(registry.notifier().has_pending("chat-a"));

    clock.advance(window);
    registry.tick();
    assert!(registry.notifier().pending_channels().is_empty());
    assert!(!registry.statuses().has_pending_save());

    // Already tracked, so nothing new to report.
    registry.observe(scopes_observation("chat-a", &["scopeA"], json!({"n": 4})));
    assert!(!registry.notifier().has_pending("chat-a"));
    assert_eq!(
        registry.statuses().get_scope_status("scopeA"),
        Some(ItemStatus::NeedsReview)
    );

    let lines = delivered_lines(registry.into_sink().into_inner());
    assert_eq!(lines.len(), 2);

    let chat_a = lines
        .iter()
        .find(|line| line["channel"] == "chat-a")
        .expect("chat-a delivery");
    assert_eq!(chat_a["diff"]["scopes"], json!(["scopeA", "scopeB"]));
    assert_eq!(chat_a["context"], json!({"n": 2}));

    let chat_b = lines
        .iter()
        .find(|line| line["channel"] == "chat-b")
        .expect("chat-b delivery");
    assert_eq!(chat_b["diff"]["scopes"], json!(["scopeC"]));
}

#[test]
fn message_keys_and_entity_types_merge_with_first_sample() {
    let temp = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new());
    let config = ShapewatchConfig::default();

    let mut registry = ShapeRegistry::open(
        temp.path(),
        &config,
        clock.clone(),
        JsonLinesSink::new(Vec::new()),
    );

    for (sample, entity) in [("first caption", "spoiler"), ("second caption", "spoiler")] {
        let mut observation = scopes_observation("42", &[], json!(null));
        observation.scope = Some("story".to_owned());
        observation.keys = vec!["caption_v2".to_owned()];
        observation.samples.insert("caption_v2".to_owned(), sample.to_owned());
        observation.entity_types = vec![entity.to_owned()];
        registry.observe(observation);
    }

    registry.shutdown().expect("shutdown");

    let lines = delivered_lines(registry.into_sink().into_inner());
    assert_eq!(lines.len(), 1);
    assert_eq!(
        lines[0]["diff"]["keys"],
        json!([{"scope": "story", "key": "caption_v2", "sample": "first caption"}])
    );
    assert_eq!(
        lines[0]["diff"]["entity_types"],
        json!([{"scope": "story", "entity_type": "spoiler"}])
    );
    assert!(temp.path().join(".shapewatch/registry.json").exists());
}

#[test]
fn switching_to_prod_stops_notifications_but_keeps_recording() {
    let temp = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new());
    let config = ShapewatchConfig::default();
    let overlay = storage_paths(temp.path(), &config).overlay;

    let mut registry = ShapeRegistry::open(
        temp.path(),
        &config,
        clock.clone(),
        JsonLinesSink::new(Vec::new()),
    );

    registry.observe(scopes_observation("1", &["giveaway"], json!(null)));
    assert!(registry.notifier().has_pending("1"));

    set_mode(&overlay, Mode::Prod).expect("set mode");
    assert_eq!(registry.statuses().get_mode(), Mode::Prod);

    registry.observe(scopes_observation("2", &["boost"], json!(null)));
    assert!(!registry.notifier().has_pending("2"));
    assert_eq!(
        registry.statuses().get_scope_status("boost"),
        Some(ItemStatus::NeedsReview)
    );

    registry.shutdown().expect("shutdown");
    let lines = delivered_lines(registry.into_sink().into_inner());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["channel"], "1");
}
