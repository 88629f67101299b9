use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod clock;
mod fsutil;
mod report;

pub use clock::{Clock, ManualClock, SystemClock, timestamp};
pub use fsutil::write_atomic;
pub use report::build_markdown;

pub const REGISTRY_VERSION: u32 = 1;
pub const SAMPLE_MAX_CHARS: usize = 120;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Ord, PartialOrd,
)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Process,
    Ignore,
    #[default]
    NeedsReview,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 3] = [Self::Process, Self::Ignore, Self::NeedsReview];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Ignore => "ignore",
            Self::NeedsReview => "needs-review",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "process" => Ok(Self::Process),
            "ignore" => Ok(Self::Ignore),
            "needs-review" | "needs_review" => Ok(Self::NeedsReview),
            other => Err(format!(
                "invalid status '{other}', expected one of: process, ignore, needs-review"
            )),
        }
    }
}

/// Which of the three registry sections an item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Scope,
    Key,
    EntityType,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scope => "scope",
            Self::Key => "key",
            Self::EntityType => "entity-type",
        }
    }
}

impl std::str::FromStr for ItemKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "scope" => Ok(Self::Scope),
            "key" => Ok(Self::Key),
            "entity-type" | "entity_type" | "type" => Ok(Self::EntityType),
            other => Err(format!(
                "invalid item kind '{other}', expected one of: scope, key, entity-type"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemEntry {
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub seen: u64,
    pub first_seen: String,
    pub last_seen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ItemEntry {
    pub fn new(status: ItemStatus, at: &str) -> Self {
        Self {
            status,
            seen: 0,
            first_seen: at.to_owned(),
            last_seen: at.to_owned(),
            sample: None,
            note: None,
        }
    }

    pub fn touch(&mut self, at: &str) {
        self.seen = self.seen.saturating_add(1);
        self.last_seen = at.to_owned();
    }
}

pub type NestedEntries = BTreeMap<String, BTreeMap<String, ItemEntry>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRegistry {
    #[serde(default = "default_registry_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub scopes: BTreeMap<String, ItemEntry>,
    #[serde(default)]
    pub keys_by_scope: NestedEntries,
    #[serde(default)]
    pub entity_types_by_scope: NestedEntries,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            updated_at: None,
            scopes: BTreeMap::new(),
            keys_by_scope: BTreeMap::new(),
            entity_types_by_scope: BTreeMap::new(),
        }
    }
}

impl StatusRegistry {
    pub fn nested(&self, kind: ItemKind) -> Option<&NestedEntries> {
        match kind {
            ItemKind::Scope => None,
            ItemKind::Key => Some(&self.keys_by_scope),
            ItemKind::EntityType => Some(&self.entity_types_by_scope),
        }
    }

    pub fn nested_mut(&mut self, kind: ItemKind) -> Option<&mut NestedEntries> {
        match kind {
            ItemKind::Scope => None,
            ItemKind::Key => Some(&mut self.keys_by_scope),
            ItemKind::EntityType => Some(&mut self.entity_types_by_scope),
        }
    }

    pub fn entry(&self, kind: ItemKind, scope: &str, name: Option<&str>) -> Option<&ItemEntry> {
        match (kind, name) {
            (ItemKind::Scope, _) => self.scopes.get(scope),
            (_, Some(name)) => self.nested(kind)?.get(scope)?.get(name),
            (_, None) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
            && self.keys_by_scope.is_empty()
            && self.entity_types_by_scope.is_empty()
    }
}

fn default_registry_version() -> u32 {
    REGISTRY_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDiff {
    pub scope: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDiff {
    pub scope: String,
    pub entity_type: String,
}

/// Items seen for the first time by one observation (or one merged batch).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub keys: Vec<KeyDiff>,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeDiff>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty() && self.keys.is_empty() && self.entity_types.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scopes.len() + self.keys.len() + self.entity_types.len()
    }
}

/// First non-blank line of `raw`, trimmed and capped at [`SAMPLE_MAX_CHARS`].
pub fn normalize_sample(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;

    let mut sample: String = line.chars().take(SAMPLE_MAX_CHARS).collect();
    if line.chars().count() > SAMPLE_MAX_CHARS {
        sample.push('…');
    }
    Some(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_kebab_case() {
        let json = serde_json::to_string(&ItemStatus::NeedsReview).expect("serialize");
        assert_eq!(json, "\"needs-review\"");
        assert_eq!("needs-review".parse::<ItemStatus>(), Ok(ItemStatus::NeedsReview));
        assert!("maybe".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn registry_serializes_with_camel_case_sections() {
        let mut registry = StatusRegistry::default();
        registry.scopes.insert(
            "message".to_owned(),
            ItemEntry::new(ItemStatus::Process, "2026-01-01T00:00:00.000Z"),
        );

        let json = serde_json::to_value(&registry).expect("serialize");
        assert_eq!(json["version"], 1);
        assert!(json.get("keysByScope").is_some());
        assert!(json.get("entityTypesByScope").is_some());
        assert_eq!(json["scopes"]["message"]["firstSeen"], "2026-01-01T00:00:00.000Z");
        assert!(json["scopes"]["message"].get("sample").is_none());
    }

    #[test]
    fn touch_bumps_counter_and_last_seen_only() {
        let mut entry = ItemEntry::new(ItemStatus::Ignore, "t0");
        entry.touch("t1");
        entry.touch("t2");

        assert_eq!(entry.seen, 2);
        assert_eq!(entry.first_seen, "t0");
        assert_eq!(entry.last_seen, "t2");
        assert_eq!(entry.status, ItemStatus::Ignore);
    }

    #[test]
    fn normalize_sample_keeps_first_line_and_truncates() {
        assert_eq!(normalize_sample("  hello\nworld"), Some("hello".to_owned()));
        assert_eq!(normalize_sample("   "), None);
        assert_eq!(normalize_sample("\n  \nreal text\nmore"), Some("real text".to_owned()));

        let long = "x".repeat(SAMPLE_MAX_CHARS + 10);
        let sample = normalize_sample(&long).expect("sample");
        assert_eq!(sample.chars().count(), SAMPLE_MAX_CHARS + 1);
        assert!(sample.ends_with('…'));
    }
}
