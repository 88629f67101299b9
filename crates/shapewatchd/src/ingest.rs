use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shapewatch_config::{Mode, OverlayCache, ShapewatchConfig, storage_paths};
use shapewatch_core::{Clock, DiffReport};
use shapewatch_store::{KeySetStore, StatusStore};

use crate::notifier::{NotificationSink, Notifier};

pub const DEFAULT_CHANNEL: &str = "default";

/// One line of the ingest stream. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub update_keys: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub samples: BTreeMap<String, String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub api_shapes: BTreeMap<String, Value>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub reply_to: Option<Value>,
}

#[derive(Debug, Serialize)]
struct DeliveryLine<'a> {
    channel: &'a str,
    diff: &'a DiffReport,
    context: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a Value>,
}

/// Writes each delivered batch as one JSON line.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    out: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> NotificationSink<Value, Value> for JsonLinesSink<W> {
    fn deliver(
        &mut self,
        channel: &str,
        diff: &DiffReport,
        context: &Value,
        reply_to: Option<&Value>,
    ) -> Result<()> {
        let line = serde_json::to_string(&DeliveryLine {
            channel,
            diff,
            context,
            reply_to,
        })
        .context("failed to serialize notification")?;
        writeln!(self.out, "{line}").context("failed to write notification")?;
        self.out.flush().context("failed to flush notification output")?;
        Ok(())
    }
}

pub fn open_stores(
    workspace: &Path,
    config: &ShapewatchConfig,
    clock: Arc<dyn Clock>,
) -> (KeySetStore, StatusStore) {
    let paths = storage_paths(workspace, config);
    let keysets = KeySetStore::open(paths.keyset, paths.keyset_snapshot);
    let statuses = StatusStore::open(
        paths.registry,
        OverlayCache::new(paths.overlay),
        clock,
        Duration::from_millis(config.timing.save_debounce_ms),
        Some(&keysets),
    );
    (keysets, statuses)
}

/// The stores and the notifier wired together; constructed once per process.
pub struct ShapeRegistry<S> {
    keysets: KeySetStore,
    statuses: StatusStore,
    notifier: Notifier<Value, Value, S>,
}

impl<S> ShapeRegistry<S>
where
    S: NotificationSink<Value, Value>,
{
    pub fn open(
        workspace: &Path,
        config: &ShapewatchConfig,
        clock: Arc<dyn Clock>,
        sink: S,
    ) -> Self {
        let (keysets, statuses) = open_stores(workspace, config, Arc::clone(&clock));
        let notifier = Notifier::new(
            Duration::from_millis(config.timing.notify_debounce_ms),
            clock,
            sink,
        );
        Self {
            keysets,
            statuses,
            notifier,
        }
    }

    pub fn keysets(&self) -> &KeySetStore {
        &self.keysets
    }

    pub fn statuses(&self) -> &StatusStore {
        &self.statuses
    }

    pub fn notifier(&self) -> &Notifier<Value, Value, S> {
        &self.notifier
    }

    pub fn into_sink(self) -> S {
        self.notifier.into_sink()
    }

    /// Records one observation and queues whatever was new for review.
    /// In `prod` mode nothing is queued; new items still land as `needs-review`.
    pub fn observe(&mut self, observation: Observation) -> DiffReport {
        let Observation {
            channel,
            update_keys,
            scopes,
            scope,
            keys,
            samples,
            entity_types,
            api_shapes,
            context,
            reply_to,
        } = observation;

        self.keysets.record_update_keys(&update_keys);
        for (method, value) in &api_shapes {
            self.keysets.record_api_shape(method, value);
        }

        let mut diff = DiffReport {
            scopes: self.statuses.observe_scopes(&scopes),
            ..DiffReport::default()
        };

        if let Some(scope) = scope.as_deref().map(str::trim).filter(|scope| !scope.is_empty()) {
            if !keys.is_empty() {
                self.keysets.record_payload_keys(scope, &keys);
                diff.keys = self
                    .statuses
                    .observe_message_keys(scope, &keys, Some(&samples));
            }
            if !entity_types.is_empty() {
                for entity_type in &entity_types {
                    self.keysets.record_entity_type(entity_type);
                }
                diff.entity_types = self.statuses.observe_entity_types(scope, &entity_types);
            }
        }

        if diff.is_empty() {
            return diff;
        }

        let channel = channel.as_deref().unwrap_or(DEFAULT_CHANNEL);
        match self.statuses.get_mode() {
            Mode::Prod => {
                tracing::info!(channel = %channel, items = diff.len(), "new items recorded, notifications off in prod mode");
            }
            mode => {
                if mode == Mode::Debug {
                    tracing::info!(channel = %channel, diff = ?diff, "queueing diff");
                }
                self.notifier
                    .queue(channel, diff.clone(), context, reply_to);
            }
        }

        diff
    }

    /// Fires any timers that are due: notifier windows and the debounced save.
    pub fn tick(&mut self) {
        self.notifier.poll();
        self.statuses.tick();
    }

    /// Delivers every pending batch and writes the registry.
    pub fn shutdown(&mut self) -> Result<()> {
        let delivered = self.notifier.flush_all();
        tracing::info!(delivered, "flushed pending notifications");
        self.statuses
            .save_now()
            .context("failed to save status registry on shutdown")
    }

    pub fn handle_line(&mut self, line: &str) -> Option<DiffReport> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str::<Observation>(line) {
            Ok(observation) => Some(self.observe(observation)),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed observation line");
                None
            }
        }
    }
}

/// Reads observations from `input` until EOF or until `stop` is raised,
/// pumping timers every `poll_interval`, then flushes everything.
pub fn run_watch_loop<S, I>(
    registry: &mut ShapeRegistry<S>,
    input: I,
    poll_interval: Duration,
    stop: &AtomicBool,
) -> Result<()>
where
    S: NotificationSink<Value, Value>,
    I: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        for line in input.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to read observation input");
                    break;
                }
            }
        }
    });

    loop {
        match rx.recv_timeout(poll_interval) {
            Ok(line) => {
                registry.handle_line(&line);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        while let Ok(line) = rx.try_recv() {
            registry.handle_line(&line);
        }

        registry.tick();

        if stop.load(Ordering::SeqCst) {
            tracing::info!("stop requested, shutting down watch loop");
            return registry.shutdown();
        }
    }

    tracing::info!("observation input closed");
    registry.shutdown()
}
