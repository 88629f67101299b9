use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use shapewatch_config::{
    ShapewatchConfig, ensure_workspace_config, load_overlay, set_mode, set_note, set_status,
    storage_paths, validate_config,
};
use shapewatch_core::{Clock, SystemClock, build_markdown};
use shapewatch_store::{KeySetStore, ResetOverlay};
use shapewatchd::cli::{Cli, Commands, LogFormat, ModeArgs, WatchArgs, parse_cli};
use shapewatchd::ingest::{JsonLinesSink, ShapeRegistry, open_stores, run_watch_loop};
use shapewatchd::lock::DaemonLock;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_logging(cli.log_format);
    run(cli)
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Human => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.workspace).with_context(|| {
        format!("failed to create workspace {}", cli.workspace.display())
    })?;
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            workspace.join(".shapewatch/config.toml").display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    match cli.command.unwrap_or(Commands::Watch(WatchArgs::default())) {
        Commands::Watch(args) => run_watch(&workspace, config, args),
        Commands::Report => run_report(&workspace, &config),
        Commands::SetStatus(args) => {
            let overlay = storage_paths(&workspace, &config).overlay;
            set_status(
                &overlay,
                args.kind,
                &args.scope,
                args.name.as_deref(),
                args.status,
            )
            .with_context(|| format!("failed to update overlay {}", overlay.display()))?;
            tracing::info!(kind = args.kind.as_str(), scope = %args.scope, name = ?args.name, status = %args.status, "overlay status written");
            Ok(())
        }
        Commands::SetNote(args) => {
            let overlay = storage_paths(&workspace, &config).overlay;
            set_note(
                &overlay,
                args.kind,
                &args.scope,
                args.name.as_deref(),
                args.note.as_deref(),
            )
            .with_context(|| format!("failed to update overlay {}", overlay.display()))?;
            Ok(())
        }
        Commands::Mode(args) => run_mode(&workspace, &config, args),
        Commands::Reset(args) => {
            let paths = storage_paths(&workspace, &config);
            let _lock = DaemonLock::acquire(&paths.lock)?;
            let (mut keysets, mut statuses) = open_stores(&workspace, &config, system_clock());
            keysets.reset();
            let overlay = if args.clear_overlay {
                ResetOverlay::Clear
            } else {
                ResetOverlay::Keep
            };
            statuses
                .reset(overlay, Some(&keysets))
                .context("failed to reset status registry")?;
            Ok(())
        }
        Commands::Categorize { label } => {
            let paths = storage_paths(&workspace, &config);
            let keysets = KeySetStore::open(paths.keyset, paths.keyset_snapshot);
            println!("{}", keysets.categorize(&label).as_str());
            Ok(())
        }
    }
}

fn run_watch(workspace: &Path, mut config: ShapewatchConfig, args: WatchArgs) -> Result<()> {
    if let Some(save_debounce_ms) = args.save_debounce_ms.filter(|ms| *ms > 0) {
        config.timing.save_debounce_ms = save_debounce_ms;
    }
    if let Some(notify_debounce_ms) = args.notify_debounce_ms.filter(|ms| *ms > 0) {
        config.timing.notify_debounce_ms = notify_debounce_ms;
    }

    let paths = storage_paths(workspace, &config);
    let _lock = DaemonLock::acquire(&paths.lock)?;

    let mut registry = ShapeRegistry::open(
        workspace,
        &config,
        system_clock(),
        JsonLinesSink::new(std::io::stdout()),
    );
    tracing::info!(
        workspace = %workspace.display(),
        mode = registry.statuses().get_mode().as_str(),
        "watching observations on stdin"
    );

    let stop = Arc::new(AtomicBool::new(false));
    install_stop_handler(Arc::clone(&stop))?;

    run_watch_loop(
        &mut registry,
        BufReader::new(std::io::stdin()),
        Duration::from_millis(config.timing.poll_interval_ms),
        &stop,
    )
}

#[cfg(unix)]
fn install_stop_handler(stop: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            tracing::info!(signal, "received signal, flushing before exit");
            stop.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
}

#[cfg(windows)]
fn install_stop_handler(stop: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::info!("received Ctrl+C, flushing before exit");
        stop.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")
}

fn run_report(workspace: &Path, config: &ShapewatchConfig) -> Result<()> {
    let paths = storage_paths(workspace, config);
    let _lock = DaemonLock::acquire(&paths.lock)?;

    let (_, mut statuses) = open_stores(workspace, config, system_clock());
    statuses
        .save_now()
        .with_context(|| format!("failed to save registry {}", statuses.path().display()))?;
    print!("{}", build_markdown(&statuses.snapshot()));
    Ok(())
}

fn run_mode(workspace: &Path, config: &ShapewatchConfig, args: ModeArgs) -> Result<()> {
    let overlay_path = storage_paths(workspace, config).overlay;
    if let Some(mode) = args.set {
        set_mode(&overlay_path, mode)
            .with_context(|| format!("failed to update overlay {}", overlay_path.display()))?;
    }

    let overlay = load_overlay(&overlay_path)
        .with_context(|| format!("failed to read overlay {}", overlay_path.display()))?;
    println!("{}", overlay.mode().as_str());
    Ok(())
}

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
