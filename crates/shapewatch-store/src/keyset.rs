use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shapewatch_core::write_atomic;

use crate::StoreError;

pub const UPDATE_LABEL: &str = "update";
pub const MESSAGE_LABEL: &str = "message";
pub const PAYLOAD_LABEL_PREFIX: &str = "payload:";
pub const API_LABEL_PREFIX: &str = "api:";
/// Prefix used by sample-capture callers when asking about an API method.
pub const API_SHAPE_CATEGORY_PREFIX: &str = "api_";

const DEFAULT_UPDATE_KEYS: &[&str] = &[
    "callback_query",
    "channel_post",
    "message",
    "my_chat_member",
    "update_id",
];

const DEFAULT_MESSAGE_KEYS: &[&str] = &[
    "caption",
    "caption_entities",
    "chat",
    "date",
    "document",
    "entities",
    "from",
    "media_group_id",
    "message_id",
    "photo",
    "reply_to_message",
    "text",
];

const DEFAULT_ENTITY_TYPES: &[&str] = &[
    "bold",
    "code",
    "italic",
    "mention",
    "pre",
    "strikethrough",
    "text_link",
    "underline",
    "url",
];

/// On-disk layout of the key-set file. Every array is sorted and unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySetFile {
    #[serde(default)]
    pub update_keys: Vec<String>,
    #[serde(default)]
    pub message_keys: Vec<String>,
    #[serde(default)]
    pub text_entity_types: Vec<String>,
    #[serde(default)]
    pub payloads: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub api_shapes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelCategory {
    Handled,
    Unknown,
}

impl LabelCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug)]
pub struct KeySetStore {
    path: PathBuf,
    snapshot_path: PathBuf,
    labels: BTreeMap<String, BTreeSet<String>>,
    entity_types: BTreeSet<String>,
    loaded_from_disk: bool,
    write_count: u64,
}

impl KeySetStore {
    /// Loads the key-set file, falling back to the built-in seed when it is
    /// missing or unreadable. Never fails: the store must be usable on a fresh install.
    pub fn open(path: impl Into<PathBuf>, snapshot_path: impl Into<PathBuf>) -> Self {
        let mut store = Self {
            path: path.into(),
            snapshot_path: snapshot_path.into(),
            labels: BTreeMap::new(),
            entity_types: BTreeSet::new(),
            loaded_from_disk: false,
            write_count: 0,
        };

        match read_keyset_file(&store.path) {
            Ok(file) => {
                store.apply_file(file);
                store.loaded_from_disk = true;
            }
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %store.path.display(), "no key-set file yet, using built-in seed");
                store.apply_defaults();
                store.write_snapshot();
            }
            Err(err) => {
                tracing::warn!(
                    path = %store.path.display(),
                    error = %err,
                    "key-set file unreadable, using built-in seed"
                );
                store.apply_defaults();
                store.write_snapshot();
            }
        }

        store
    }

    /// Whether the in-memory sets came from a previously persisted file.
    pub fn loaded_from_disk(&self) -> bool {
        self.loaded_from_disk
    }

    /// Number of times the store has been written since it was opened.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn labels(&self) -> Vec<&str> {
        self.labels.keys().map(String::as_str).collect()
    }

    pub fn known(&self, label: &str) -> Vec<String> {
        self.labels
            .get(label)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, label: &str, key: &str) -> bool {
        self.labels.get(label).is_some_and(|keys| keys.contains(key))
    }

    pub fn entity_types(&self) -> Vec<String> {
        self.entity_types.iter().cloned().collect()
    }

    /// Adds unseen keys under `label` and returns them in input order.
    /// Writes to disk only when something was actually added.
    pub fn record_keys<I, S>(&mut self, label: &str, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known = self.labels.get(label);
        let mut fresh = BTreeSet::new();
        let mut new_keys = Vec::new();

        for key in keys {
            let key = key.as_ref().trim();
            if key.is_empty() || known.is_some_and(|set| set.contains(key)) {
                continue;
            }
            if fresh.insert(key.to_owned()) {
                new_keys.push(key.to_owned());
            }
        }

        if new_keys.is_empty() {
            return new_keys;
        }

        self.labels
            .entry(label.to_owned())
            .or_default()
            .extend(fresh);
        tracing::info!(label = %label, new_keys = ?new_keys, "new keys observed");
        self.persist();

        new_keys
    }

    pub fn record_update_keys<I, S>(&mut self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.record_keys(UPDATE_LABEL, keys)
    }

    pub fn record_message_keys<I, S>(&mut self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.record_keys(MESSAGE_LABEL, keys)
    }

    pub fn record_payload_keys<I, S>(&mut self, payload_path: &str, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.record_keys(&format!("{PAYLOAD_LABEL_PREFIX}{payload_path}"), keys)
    }

    pub fn record_entity_type(&mut self, entity_type: &str) -> bool {
        let entity_type = entity_type.trim();
        if entity_type.is_empty() || self.entity_types.contains(entity_type) {
            return false;
        }

        self.entity_types.insert(entity_type.to_owned());
        tracing::info!(entity_type = %entity_type, "new entity type observed");
        self.persist();
        true
    }

    pub fn record_api_shape(&mut self, method: &str, value: &Value) -> Vec<String> {
        let label = format!("{API_LABEL_PREFIX}{}", method.trim());
        self.record_keys(&label, shape_keys(value))
    }

    pub fn categorize(&self, label: &str) -> LabelCategory {
        let handled = if label == UPDATE_LABEL || label == MESSAGE_LABEL {
            self.labels.get(label).is_some_and(|keys| !keys.is_empty())
        } else if let Some(method) = label.strip_prefix(API_SHAPE_CATEGORY_PREFIX) {
            self.labels
                .contains_key(&format!("{API_LABEL_PREFIX}{method}"))
        } else if label.starts_with(PAYLOAD_LABEL_PREFIX) {
            self.labels.contains_key(label)
        } else {
            false
        };

        if handled {
            LabelCategory::Handled
        } else {
            LabelCategory::Unknown
        }
    }

    /// Drops everything learned so far and goes back to the built-in seed.
    pub fn reset(&mut self) {
        self.labels.clear();
        self.entity_types.clear();
        self.apply_defaults();
        tracing::info!(path = %self.path.display(), "key-set store reset");
        self.persist();
    }

    pub fn to_file(&self) -> KeySetFile {
        let mut file = KeySetFile {
            text_entity_types: self.entity_types.iter().cloned().collect(),
            ..KeySetFile::default()
        };

        for (label, keys) in &self.labels {
            let keys: Vec<String> = keys.iter().cloned().collect();
            match label.as_str() {
                UPDATE_LABEL => file.update_keys = keys,
                MESSAGE_LABEL => file.message_keys = keys,
                other if other.starts_with(API_LABEL_PREFIX) => {
                    file.api_shapes.insert(label.clone(), keys);
                }
                _ => {
                    file.payloads.insert(label.clone(), keys);
                }
            }
        }

        file
    }

    pub fn render_snapshot(&self) -> String {
        let file = self.to_file();
        let mut out = String::from("# Known keys\n");

        render_list(&mut out, "## Update keys", &file.update_keys);
        render_list(&mut out, "## Message keys", &file.message_keys);
        render_list(&mut out, "## Text entity types", &file.text_entity_types);

        out.push_str("\n## Payloads\n");
        for (label, keys) in &file.payloads {
            render_list(&mut out, &format!("### {label}"), keys);
        }

        out.push_str("\n## API shapes\n");
        for (label, keys) in &file.api_shapes {
            render_list(&mut out, &format!("### {label}"), keys);
        }

        out
    }

    fn apply_file(&mut self, file: KeySetFile) {
        let KeySetFile {
            update_keys,
            message_keys,
            text_entity_types,
            payloads,
            api_shapes,
        } = file;

        self.insert_label(UPDATE_LABEL.to_owned(), update_keys);
        self.insert_label(MESSAGE_LABEL.to_owned(), message_keys);
        for (label, keys) in payloads.into_iter().chain(api_shapes) {
            self.insert_label(label, keys);
        }
        self.entity_types.extend(text_entity_types);
    }

    fn apply_defaults(&mut self) {
        self.insert_label(
            UPDATE_LABEL.to_owned(),
            DEFAULT_UPDATE_KEYS.iter().map(|key| (*key).to_owned()),
        );
        self.insert_label(
            MESSAGE_LABEL.to_owned(),
            DEFAULT_MESSAGE_KEYS.iter().map(|key| (*key).to_owned()),
        );
        self.entity_types
            .extend(DEFAULT_ENTITY_TYPES.iter().map(|key| (*key).to_owned()));
    }

    fn insert_label(&mut self, label: String, keys: impl IntoIterator<Item = String>) {
        self.labels.entry(label).or_default().extend(keys);
    }

    fn persist(&mut self) {
        self.write_count += 1;

        let written = serde_json::to_vec_pretty(&self.to_file())
            .map_err(StoreError::from)
            .and_then(|mut bytes| {
                bytes.push(b'\n');
                write_atomic(&self.path, &bytes).map_err(StoreError::from)
            });
        if let Err(err) = written {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to write key-set file");
        }

        self.write_snapshot();
    }

    fn write_snapshot(&self) {
        let snapshot = self.render_snapshot();
        if let Err(err) = write_atomic(&self.snapshot_path, snapshot.as_bytes()) {
            tracing::warn!(
                path = %self.snapshot_path.display(),
                error = %err,
                "failed to write key-set snapshot"
            );
        }
    }
}

/// Field names describing the shape of `value`.
pub fn shape_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => {
            let mut keys = vec!["[array]".to_owned()];
            if let Some(Value::Object(first)) = items.iter().find(|item| item.is_object()) {
                keys.extend(first.keys().map(|key| format!("item.{key}")));
            }
            keys
        }
        Value::Null => vec!["[null]".to_owned()],
        Value::Bool(_) => vec!["[boolean]".to_owned()],
        Value::Number(_) => vec!["[number]".to_owned()],
        Value::String(_) => vec!["[string]".to_owned()],
    }
}

fn read_keyset_file(path: &Path) -> Result<KeySetFile, StoreError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn render_list(out: &mut String, heading: &str, keys: &[String]) {
    let _ = write!(out, "\n{heading} ({})\n\n", keys.len());
    for key in keys {
        let _ = writeln!(out, "- {key}");
    }
}
