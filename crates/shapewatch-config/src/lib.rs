use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod overlay;

pub use overlay::{
    ConfigOverlay, Mode, OverlayCache, OverlayEntry, clear_overlay, load_overlay, set_mode,
    set_note, set_status,
};

pub const SHAPEWATCH_DIR_NAME: &str = ".shapewatch";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOCK_FILE_NAME: &str = "daemon.lock";
pub const DEFAULT_KEYSET_FILE: &str = "known_keys.json";
pub const DEFAULT_KEYSET_SNAPSHOT_FILE: &str = "known_keys.md";
pub const DEFAULT_REGISTRY_FILE: &str = "registry.json";
pub const DEFAULT_OVERLAY_FILE: &str = "overlay.json";
pub const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 1_000;
pub const DEFAULT_NOTIFY_DEBOUNCE_MS: u64 = 3_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShapewatchConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_keyset_file")]
    pub keyset_file: String,
    #[serde(default = "default_keyset_snapshot_file")]
    pub keyset_snapshot_file: String,
    #[serde(default = "default_registry_file")]
    pub registry_file: String,
    #[serde(default = "default_overlay_file")]
    pub overlay_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keyset_file: default_keyset_file(),
            keyset_snapshot_file: default_keyset_snapshot_file(),
            registry_file: default_registry_file(),
            overlay_file: default_overlay_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
    #[serde(default = "default_notify_debounce_ms")]
    pub notify_debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: DEFAULT_SAVE_DEBOUNCE_MS,
            notify_debounce_ms: DEFAULT_NOTIFY_DEBOUNCE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Absolute locations of every file the daemon reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub keyset: PathBuf,
    pub keyset_snapshot: PathBuf,
    pub registry: PathBuf,
    pub overlay: PathBuf,
    pub lock: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("overlay json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub fn shapewatch_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(SHAPEWATCH_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    shapewatch_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn storage_paths(workspace_root: impl AsRef<Path>, config: &ShapewatchConfig) -> StoragePaths {
    let dir = shapewatch_dir(workspace_root);
    StoragePaths {
        keyset: dir.join(&config.storage.keyset_file),
        keyset_snapshot: dir.join(&config.storage.keyset_snapshot_file),
        registry: dir.join(&config.storage.registry_file),
        overlay: dir.join(&config.storage.overlay_file),
        lock: dir.join(LOCK_FILE_NAME),
    }
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<ShapewatchConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(ShapewatchConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: ShapewatchConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<ShapewatchConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(shapewatch_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = ShapewatchConfig::default();
    let content = toml::to_string_pretty(&config)?;
    shapewatch_core::write_atomic(&path, content.as_bytes())?;

    Ok(config)
}

pub fn validate_config(config: &ShapewatchConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.timing.notify_debounce_ms < config.timing.poll_interval_ms {
        warnings.push(ConfigWarning {
            code: "notify_window_below_poll",
            message: format!(
                "timing.notify_debounce_ms ({}) is shorter than timing.poll_interval_ms ({}); batches will be delivered late",
                config.timing.notify_debounce_ms, config.timing.poll_interval_ms
            ),
        });
    }

    let storage = &config.storage;
    let files = [
        &storage.keyset_file,
        &storage.keyset_snapshot_file,
        &storage.registry_file,
        &storage.overlay_file,
    ];
    for (index, file) in files.iter().enumerate() {
        if files[..index].contains(file) {
            warnings.push(ConfigWarning {
                code: "storage_file_collision",
                message: format!("storage file '{file}' is configured more than once"),
            });
        }
    }

    warnings
}

fn default_keyset_file() -> String {
    DEFAULT_KEYSET_FILE.to_owned()
}

fn default_keyset_snapshot_file() -> String {
    DEFAULT_KEYSET_SNAPSHOT_FILE.to_owned()
}

fn default_registry_file() -> String {
    DEFAULT_REGISTRY_FILE.to_owned()
}

fn default_overlay_file() -> String {
    DEFAULT_OVERLAY_FILE.to_owned()
}

fn default_save_debounce_ms() -> u64 {
    DEFAULT_SAVE_DEBOUNCE_MS
}

fn default_notify_debounce_ms() -> u64 {
    DEFAULT_NOTIFY_DEBOUNCE_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn normalize_file_name(input: &mut String, fallback: fn() -> String) {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        *input = fallback();
    } else if trimmed.len() != input.len() {
        *input = trimmed.to_owned();
    }
}

fn normalize_config(mut config: ShapewatchConfig) -> ShapewatchConfig {
    let storage = &mut config.storage;
    normalize_file_name(&mut storage.keyset_file, default_keyset_file);
    normalize_file_name(&mut storage.keyset_snapshot_file, default_keyset_snapshot_file);
    normalize_file_name(&mut storage.registry_file, default_registry_file);
    normalize_file_name(&mut storage.overlay_file, default_overlay_file);

    let timing = &mut config.timing;
    if timing.save_debounce_ms == 0 {
        timing.save_debounce_ms = DEFAULT_SAVE_DEBOUNCE_MS;
    }
    if timing.notify_debounce_ms == 0 {
        timing.notify_debounce_ms = DEFAULT_NOTIFY_DEBOUNCE_MS;
    }
    if timing.poll_interval_ms == 0 {
        timing.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
    }

    config
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn ensure_workspace_config_creates_default_file() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();

        let config = ensure_workspace_config(workspace).expect("ensure config");

        assert_eq!(config.timing.save_debounce_ms, DEFAULT_SAVE_DEBOUNCE_MS);
        assert_eq!(config.storage.registry_file, DEFAULT_REGISTRY_FILE);
        assert!(config_path(workspace).exists());

        let content = fs::read_to_string(config_path(workspace)).expect("read config file");
        assert!(content.contains("[storage]"));
        assert!(content.contains("[timing]"));
        assert!(content.contains("notify_debounce_ms = 3000"));
    }

    #[test]
    fn load_workspace_config_parses_and_normalizes_values() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();
        fs::create_dir_all(shapewatch_dir(workspace)).expect("create .shapewatch");

        let raw = r#"
[storage]
registry_file = "  review.json "
overlay_file = ""

[timing]
notify_debounce_ms = 500
save_debounce_ms = 0
"#;
        fs::write(config_path(workspace), raw).expect("write config");

        let config = load_workspace_config(workspace).expect("load config");

        assert_eq!(config.storage.registry_file, "review.json");
        assert_eq!(config.storage.overlay_file, DEFAULT_OVERLAY_FILE);
        assert_eq!(config.storage.keyset_file, DEFAULT_KEYSET_FILE);
        assert_eq!(config.timing.notify_debounce_ms, 500);
        assert_eq!(config.timing.save_debounce_ms, DEFAULT_SAVE_DEBOUNCE_MS);
        assert_eq!(config.timing.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);

        let paths = storage_paths(workspace, &config);
        assert_eq!(paths.registry, workspace.join(".shapewatch/review.json"));
        assert_eq!(paths.lock, workspace.join(".shapewatch/daemon.lock"));
    }

    #[test]
    fn validate_config_flags_colliding_files_and_short_windows() {
        let mut config = ShapewatchConfig::default();
        assert!(validate_config(&config).is_empty());

        config.storage.overlay_file = DEFAULT_REGISTRY_FILE.to_owned();
        config.timing.notify_debounce_ms = 10;

        let codes: Vec<_> = validate_config(&config)
            .into_iter()
            .map(|warning| warning.code)
            .collect();
        assert_eq!(codes, vec!["notify_window_below_poll", "storage_file_collision"]);
    }
}
