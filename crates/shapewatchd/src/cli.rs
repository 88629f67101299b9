use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use shapewatch_config::Mode;
use shapewatch_core::{ItemKind, ItemStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct WatchArgs {
    #[arg(long, help = "Override timing.save_debounce_ms from config.toml")]
    pub save_debounce_ms: Option<u64>,

    #[arg(long, help = "Override timing.notify_debounce_ms from config.toml")]
    pub notify_debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SetStatusArgs {
    #[arg(value_parser = parse_item_kind, help = "Item kind: scope, key, or entity-type")]
    pub kind: ItemKind,

    pub scope: String,

    #[arg(value_parser = parse_item_status, help = "process, ignore, or needs-review")]
    pub status: ItemStatus,

    #[arg(long, help = "Key or entity type name (required unless kind is scope)")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SetNoteArgs {
    #[arg(value_parser = parse_item_kind, help = "Item kind: scope, key, or entity-type")]
    pub kind: ItemKind,

    pub scope: String,

    #[arg(help = "Note text; omit to clear the note")]
    pub note: Option<String>,

    #[arg(long, help = "Key or entity type name (required unless kind is scope)")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct ModeArgs {
    #[arg(long, value_parser = parse_mode, help = "Write a new mode into the overlay")]
    pub set: Option<Mode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct ResetArgs {
    #[arg(long, help = "Also delete the overlay file")]
    pub clear_overlay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Read JSON-line observations from stdin and print batched notifications.
    Watch(WatchArgs),
    /// Save the registry and print the markdown review report.
    Report,
    /// Record a review decision in the overlay file.
    SetStatus(SetStatusArgs),
    /// Attach or clear a note in the overlay file.
    SetNote(SetNoteArgs),
    /// Print (or set) the overlay's operating mode.
    Mode(ModeArgs),
    /// Forget every known key and review entry.
    Reset(ResetArgs),
    /// Print whether a sample label is already tracked.
    Categorize { label: String },
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Schema discovery and review registry")]
pub struct Cli {
    #[arg(long, default_value = ".", help = "Workspace root holding .shapewatch/")]
    pub workspace: PathBuf,

    #[arg(
        long,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log output format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_item_kind(value: &str) -> Result<ItemKind, String> {
    value.parse()
}

fn parse_item_status(value: &str) -> Result<ItemStatus, String> {
    value.parse()
}

fn parse_mode(value: &str) -> Result<Mode, String> {
    value.parse()
}
