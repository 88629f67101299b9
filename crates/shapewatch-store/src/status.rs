use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shapewatch_config::{ConfigOverlay, Mode, OverlayCache, OverlayEntry, clear_overlay};
use shapewatch_core::{
    Clock, EntityTypeDiff, ItemEntry, ItemKind, ItemStatus, KeyDiff, NestedEntries,
    StatusRegistry, normalize_sample, timestamp, write_atomic,
};

use crate::StoreError;
use crate::keyset::{KeySetStore, MESSAGE_LABEL, UPDATE_LABEL};

/// Scope that starts out ignored on a fresh registry unless already known.
pub const DEFAULT_IGNORED_SCOPE: &str = "edited_message";
/// Scope that seeded message keys and entity types are filed under.
pub const SEED_SCOPE: &str = "message";

const NON_SCOPE_UPDATE_KEYS: &[&str] = &["update_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOverlay {
    Keep,
    Clear,
}

pub struct StatusStore {
    path: PathBuf,
    registry: StatusRegistry,
    overlay: OverlayCache,
    clock: Arc<dyn Clock>,
    save_debounce: Duration,
    save_deadline: Option<Instant>,
    write_count: u64,
}

impl StatusStore {
    pub fn open(
        path: impl Into<PathBuf>,
        overlay: OverlayCache,
        clock: Arc<dyn Clock>,
        save_debounce: Duration,
        seed: Option<&KeySetStore>,
    ) -> Self {
        let path = path.into();
        let mut store = Self {
            path,
            registry: StatusRegistry::default(),
            overlay,
            clock,
            save_debounce,
            save_deadline: None,
            write_count: 0,
        };

        match read_registry(&store.path) {
            Ok(registry) => store.registry = registry,
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                store.registry = seeded_registry(seed, &timestamp(store.clock.as_ref()));
                tracing::info!(
                    path = %store.path.display(),
                    scopes = store.registry.scopes.len(),
                    "seeded new status registry"
                );
                if let Err(err) = store.save_now() {
                    tracing::warn!(path = %store.path.display(), error = %err, "failed to write seeded registry");
                    store.mark_dirty();
                }
            }
            Err(err) => {
                tracing::warn!(
                    path = %store.path.display(),
                    error = %err,
                    "status registry unreadable, starting from seed"
                );
                store.registry = seeded_registry(seed, &timestamp(store.clock.as_ref()));
                store.mark_dirty();
            }
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn has_pending_save(&self) -> bool {
        self.save_deadline.is_some()
    }

    /// Starts tracking unseen scopes and returns the ones that were new.
    pub fn observe_scopes<I, S>(&mut self, scopes: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let overlay = self.overlay.current();
        let now = timestamp(self.clock.as_ref());
        let mut added = Vec::new();
        let mut touched = false;

        for scope in scopes {
            let scope = scope.as_ref().trim();
            if scope.is_empty() {
                continue;
            }

            let overrides = overlay.entry(ItemKind::Scope, scope, None);
            let entry = self
                .registry
                .scopes
                .entry(scope.to_owned())
                .or_insert_with(|| {
                    added.push(scope.to_owned());
                    new_entry(overrides, &now)
                });
            entry.touch(&now);
            apply_overlay(entry, overrides);
            touched = true;
        }

        if touched {
            self.mark_dirty();
        }
        added
    }

    pub fn observe_message_keys<I, S>(
        &mut self,
        scope: &str,
        keys: I,
        samples: Option<&BTreeMap<String, String>>,
    ) -> Vec<KeyDiff>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let scope = scope.trim();
        self.observe_nested(ItemKind::Key, scope, keys, samples)
            .into_iter()
            .map(|(key, sample)| KeyDiff {
                scope: scope.to_owned(),
                key,
                sample,
            })
            .collect()
    }

    pub fn observe_entity_types<I, S>(&mut self, scope: &str, types: I) -> Vec<EntityTypeDiff>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let scope = scope.trim();
        self.observe_nested(ItemKind::EntityType, scope, types, None)
            .into_iter()
            .map(|(entity_type, _)| EntityTypeDiff {
                scope: scope.to_owned(),
                entity_type,
            })
            .collect()
    }

    pub fn set_scope_status(&mut self, scope: &str, status: ItemStatus) {
        self.set_status(ItemKind::Scope, scope, None, status);
    }

    pub fn set_message_key_status(&mut self, scope: &str, key: &str, status: ItemStatus) {
        self.set_status(ItemKind::Key, scope, Some(key), status);
    }

    pub fn set_entity_type_status(&mut self, scope: &str, entity_type: &str, status: ItemStatus) {
        self.set_status(ItemKind::EntityType, scope, Some(entity_type), status);
    }

    pub fn get_scope_status(&self, scope: &str) -> Option<ItemStatus> {
        self.effective_status(ItemKind::Scope, scope, None)
    }

    pub fn get_message_key_status(&self, scope: &str, key: &str) -> Option<ItemStatus> {
        self.effective_status(ItemKind::Key, scope, Some(key))
    }

    pub fn get_entity_type_status(&self, scope: &str, entity_type: &str) -> Option<ItemStatus> {
        self.effective_status(ItemKind::EntityType, scope, Some(entity_type))
    }

    /// Copy of one entry with any overlay override applied.
    pub fn get_entry(&self, kind: ItemKind, scope: &str, name: Option<&str>) -> Option<ItemEntry> {
        let mut entry = self.registry.entry(kind, scope, name)?.clone();
        let overlay = self.overlay.current();
        apply_overlay(&mut entry, overlay.entry(kind, scope, name));
        Some(entry)
    }

    pub fn get_mode(&self) -> Mode {
        self.overlay.current().mode()
    }

    /// Detached copy of the whole registry as it should be rendered, with
    /// overlay statuses and notes applied to every entry.
    pub fn snapshot(&self) -> StatusRegistry {
        let overlay = self.overlay.current();
        let mut snapshot = self.registry.clone();

        for (scope, entry) in &mut snapshot.scopes {
            apply_overlay(entry, overlay.entry(ItemKind::Scope, scope, None));
        }
        for kind in [ItemKind::Key, ItemKind::EntityType] {
            let Some(nested) = snapshot.nested_mut(kind) else {
                continue;
            };
            for (scope, entries) in nested.iter_mut() {
                for (name, entry) in entries.iter_mut() {
                    apply_overlay(entry, overlay.entry(kind, scope, Some(name)));
                }
            }
        }

        snapshot
    }

    /// Writes the registry immediately and cancels any pending debounced save.
    pub fn save_now(&mut self) -> Result<(), StoreError> {
        self.registry.updated_at = Some(timestamp(self.clock.as_ref()));
        let mut bytes = serde_json::to_vec_pretty(&self.registry)?;
        bytes.push(b'\n');

        self.write_count += 1;
        write_atomic(&self.path, &bytes)?;
        self.save_deadline = None;
        tracing::debug!(path = %self.path.display(), "status registry saved");
        Ok(())
    }

    /// Timer pump for the debounced save. Returns whether a write happened.
    pub fn tick(&mut self) -> bool {
        let now = self.clock.now();
        match self.save_deadline {
            Some(deadline) if deadline <= now => {}
            _ => return false,
        }

        match self.save_now() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "debounced registry save failed, will retry");
                self.save_deadline = Some(now + self.save_debounce);
                false
            }
        }
    }

    /// Drops every tracked entry and reseeds exactly as a first run would.
    pub fn reset(
        &mut self,
        overlay: ResetOverlay,
        seed: Option<&KeySetStore>,
    ) -> Result<(), StoreError> {
        self.registry = seeded_registry(seed, &timestamp(self.clock.as_ref()));
        if overlay == ResetOverlay::Clear {
            clear_overlay(self.overlay.path())?;
        }
        tracing::info!(path = %self.path.display(), overlay = ?overlay, "status registry reset");
        self.save_now()
    }

    fn mark_dirty(&mut self) {
        if self.save_deadline.is_none() {
            self.save_deadline = Some(self.clock.now() + self.save_debounce);
        }
    }

    fn observe_nested<I, S>(
        &mut self,
        kind: ItemKind,
        scope: &str,
        names: I,
        samples: Option<&BTreeMap<String, String>>,
    ) -> Vec<(String, Option<String>)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|name| name.as_ref().trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect();
        if scope.is_empty() || names.is_empty() {
            return Vec::new();
        }

        let overlay = self.overlay.current();
        let now = timestamp(self.clock.as_ref());
        let Some(nested) = self.registry.nested_mut(kind) else {
            return Vec::new();
        };
        let entries = nested.entry(scope.to_owned()).or_default();

        let mut added = Vec::new();
        for name in &names {
            let overrides = overlay.entry(kind, scope, Some(name));
            let mut is_new = false;
            let entry = entries.entry(name.clone()).or_insert_with(|| {
                is_new = true;
                new_entry(overrides, &now)
            });
            entry.touch(&now);
            if let Some(sample) = samples
                .and_then(|samples| samples.get(name))
                .and_then(|raw| normalize_sample(raw))
            {
                entry.sample = Some(sample);
            }
            apply_overlay(entry, overrides);

            if is_new {
                added.push((name.clone(), entry.sample.clone()));
            }
        }

        let unique: BTreeSet<&String> = names.iter().collect();
        for name in unique {
            refresh_cross_scope_notes(nested, &overlay, kind, name);
        }

        self.mark_dirty();
        added
    }

    fn set_status(&mut self, kind: ItemKind, scope: &str, name: Option<&str>, status: ItemStatus) {
        let scope = scope.trim();
        let name = name.map(str::trim);
        if scope.is_empty() || name.is_some_and(str::is_empty) {
            return;
        }

        let overlay = self.overlay.current();
        let now = timestamp(self.clock.as_ref());
        let overrides = overlay.entry(kind, scope, name);

        let entry = match (kind, name) {
            (ItemKind::Scope, _) => self.registry.scopes.entry(scope.to_owned()),
            (_, Some(name)) => {
                let Some(nested) = self.registry.nested_mut(kind) else {
                    return;
                };
                nested
                    .entry(scope.to_owned())
                    .or_default()
                    .entry(name.to_owned())
            }
            (_, None) => return,
        };
        let entry = entry.or_insert_with(|| new_entry(overrides, &now));
        entry.status = status;

        tracing::debug!(kind = kind.as_str(), scope = %scope, name = ?name, status = %status, "status set");
        self.mark_dirty();
    }

    fn effective_status(
        &self,
        kind: ItemKind,
        scope: &str,
        name: Option<&str>,
    ) -> Option<ItemStatus> {
        let stored = self.registry.entry(kind, scope, name)?;
        let overlay = self.overlay.current();
        Some(
            overlay
                .status_for(kind, scope, name)
                .unwrap_or(stored.status),
        )
    }
}

fn new_entry(overrides: Option<&OverlayEntry>, now: &str) -> ItemEntry {
    let status = overrides
        .and_then(OverlayEntry::status)
        .unwrap_or(ItemStatus::NeedsReview);
    let mut entry = ItemEntry::new(status, now);
    apply_overlay(&mut entry, overrides);
    entry
}

fn apply_overlay(entry: &mut ItemEntry, overrides: Option<&OverlayEntry>) {
    let Some(overrides) = overrides else {
        return;
    };
    if let Some(status) = overrides.status() {
        entry.status = status;
    }
    if let Some(note) = overrides.note() {
        entry.note = Some(note.to_owned());
    }
}

/// Rewrites the note of every entry named `name` with the scopes that track it.
/// Cost is linear in the number of scopes.
fn refresh_cross_scope_notes(
    nested: &mut NestedEntries,
    overlay: &ConfigOverlay,
    kind: ItemKind,
    name: &str,
) {
    let scopes: Vec<String> = nested
        .iter()
        .filter(|(_, entries)| entries.contains_key(name))
        .map(|(scope, _)| scope.clone())
        .collect();
    let note = match scopes.as_slice() {
        [] => return,
        [only] => format!("only in: {only}"),
        many => format!("scopes: {}", many.join(", ")),
    };

    for scope in &scopes {
        if let Some(entry) = nested.get_mut(scope).and_then(|entries| entries.get_mut(name)) {
            entry.note = Some(note.clone());
            apply_overlay(entry, overlay.entry(kind, scope, Some(name)));
        }
    }
}

fn seeded_registry(seed: Option<&KeySetStore>, now: &str) -> StatusRegistry {
    let mut registry = StatusRegistry::default();

    if let Some(keyset) = seed {
        for scope in keyset.known(UPDATE_LABEL) {
            if NON_SCOPE_UPDATE_KEYS.contains(&scope.as_str()) {
                continue;
            }
            registry
                .scopes
                .insert(scope, ItemEntry::new(ItemStatus::Process, now));
        }

        let keys = accepted_entries(keyset.known(MESSAGE_LABEL), now);
        if !keys.is_empty() {
            registry.keys_by_scope.insert(SEED_SCOPE.to_owned(), keys);
        }

        let types = accepted_entries(keyset.entity_types(), now);
        if !types.is_empty() {
            registry
                .entity_types_by_scope
                .insert(SEED_SCOPE.to_owned(), types);
        }
    }

    registry
        .scopes
        .entry(DEFAULT_IGNORED_SCOPE.to_owned())
        .or_insert_with(|| ItemEntry::new(ItemStatus::Ignore, now));

    registry
}

fn accepted_entries(names: Vec<String>, now: &str) -> BTreeMap<String, ItemEntry> {
    names
        .into_iter()
        .map(|name| (name, ItemEntry::new(ItemStatus::Process, now)))
        .collect()
}

fn read_registry(path: &Path) -> Result<StatusRegistry, StoreError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
