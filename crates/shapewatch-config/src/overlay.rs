use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use shapewatch_core::{ItemKind, ItemStatus, write_atomic};

use crate::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Debug,
    #[default]
    Dev,
    Prod,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Dev => "dev",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "debug" => Ok(Self::Debug),
            "dev" => Ok(Self::Dev),
            "prod" => Ok(Self::Prod),
            other => Err(format!(
                "invalid mode '{other}', expected one of: debug, dev, prod"
            )),
        }
    }
}

/// One human override. Values are kept as written so a typo in one entry
/// does not make the whole file unreadable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl OverlayEntry {
    pub fn status(&self) -> Option<ItemStatus> {
        self.status.as_deref()?.parse().ok()
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref().filter(|note| !note.trim().is_empty())
    }

    fn is_empty(&self) -> bool {
        self.status.is_none() && self.note.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scopes: BTreeMap<String, OverlayEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<String, BTreeMap<String, OverlayEntry>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entity_types: BTreeMap<String, BTreeMap<String, OverlayEntry>>,
}

impl ConfigOverlay {
    /// Effective mode; absent or unrecognized values fall back to `dev`.
    pub fn mode(&self) -> Mode {
        self.mode
            .as_deref()
            .and_then(|mode| mode.parse().ok())
            .unwrap_or_default()
    }

    pub fn entry(&self, kind: ItemKind, scope: &str, name: Option<&str>) -> Option<&OverlayEntry> {
        match (kind, name) {
            (ItemKind::Scope, _) => self.scopes.get(scope),
            (ItemKind::Key, Some(name)) => self.keys.get(scope)?.get(name),
            (ItemKind::EntityType, Some(name)) => self.entity_types.get(scope)?.get(name),
            (_, None) => None,
        }
    }

    pub fn status_for(&self, kind: ItemKind, scope: &str, name: Option<&str>) -> Option<ItemStatus> {
        self.entry(kind, scope, name)?.status()
    }

    fn entry_mut(
        &mut self,
        kind: ItemKind,
        scope: &str,
        name: Option<&str>,
    ) -> Result<&mut OverlayEntry, ConfigError> {
        let nested = match kind {
            ItemKind::Scope => return Ok(self.scopes.entry(scope.to_owned()).or_default()),
            ItemKind::Key => &mut self.keys,
            ItemKind::EntityType => &mut self.entity_types,
        };

        let name = name.ok_or_else(|| {
            ConfigError::InvalidInput(format!("{} override requires a name", kind.as_str()))
        })?;
        Ok(nested
            .entry(scope.to_owned())
            .or_default()
            .entry(name.to_owned())
            .or_default())
    }

    fn prune(&mut self) {
        self.scopes.retain(|_, entry| !entry.is_empty());
        for nested in [&mut self.keys, &mut self.entity_types] {
            for entries in nested.values_mut() {
                entries.retain(|_, entry| !entry.is_empty());
            }
            nested.retain(|_, entries| !entries.is_empty());
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    mtime: Option<SystemTime>,
    overlay: Arc<ConfigOverlay>,
}

/// Memoized view of the overlay file, re-parsed only when its mtime changes.
#[derive(Debug)]
pub struct OverlayCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

impl OverlayCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<ConfigOverlay> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mtime = match fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(mtime) => mtime,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if state.mtime.take().is_some() {
                    tracing::info!(path = %self.path.display(), "overlay file removed, using empty overlay");
                }
                state.overlay = Arc::new(ConfigOverlay::default());
                return Arc::clone(&state.overlay);
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to stat overlay file");
                return Arc::clone(&state.overlay);
            }
        };

        if state.mtime == Some(mtime) {
            return Arc::clone(&state.overlay);
        }

        match read_overlay(&self.path) {
            Ok(overlay) => {
                tracing::debug!(path = %self.path.display(), "reloaded overlay");
                state.overlay = Arc::new(overlay);
            }
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "overlay file unreadable, keeping previous overlay"
                );
            }
        }
        state.mtime = Some(mtime);

        Arc::clone(&state.overlay)
    }
}

fn read_overlay(path: &Path) -> Result<ConfigOverlay, ConfigError> {
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(ConfigOverlay::default());
    }
    Ok(serde_json::from_str(&raw)?)
}

pub fn load_overlay(path: impl AsRef<Path>) -> Result<ConfigOverlay, ConfigError> {
    match read_overlay(path.as_ref()) {
        Err(ConfigError::Io(err)) if err.kind() == ErrorKind::NotFound => {
            Ok(ConfigOverlay::default())
        }
        other => other,
    }
}

fn update_overlay(
    path: &Path,
    apply: impl FnOnce(&mut ConfigOverlay) -> Result<(), ConfigError>,
) -> Result<(), ConfigError> {
    let mut overlay = load_overlay(path)?;
    apply(&mut overlay)?;
    overlay.prune();

    let mut content = serde_json::to_string_pretty(&overlay)?;
    content.push('\n');
    write_atomic(path, content.as_bytes())?;
    Ok(())
}

pub fn set_status(
    path: impl AsRef<Path>,
    kind: ItemKind,
    scope: &str,
    name: Option<&str>,
    status: ItemStatus,
) -> Result<(), ConfigError> {
    update_overlay(path.as_ref(), |overlay| {
        overlay.entry_mut(kind, scope, name)?.status = Some(status.as_str().to_owned());
        Ok(())
    })
}

/// Sets or, with `None`, clears the note for one item.
pub fn set_note(
    path: impl AsRef<Path>,
    kind: ItemKind,
    scope: &str,
    name: Option<&str>,
    note: Option<&str>,
) -> Result<(), ConfigError> {
    let note = note.map(str::trim).filter(|note| !note.is_empty());
    update_overlay(path.as_ref(), |overlay| {
        overlay.entry_mut(kind, scope, name)?.note = note.map(str::to_owned);
        Ok(())
    })
}

pub fn set_mode(path: impl AsRef<Path>, mode: Mode) -> Result<(), ConfigError> {
    update_overlay(path.as_ref(), |overlay| {
        overlay.mode = Some(mode.as_str().to_owned());
        Ok(())
    })
}

pub fn clear_overlay(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    match fs::remove_file(path.as_ref()) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
