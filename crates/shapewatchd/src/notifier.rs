use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use shapewatch_core::{Clock, DiffReport, EntityTypeDiff, KeyDiff};

/// Last-activity timestamps per key; a key becomes due once it has been quiet
/// for the whole debounce window.
#[derive(Debug)]
pub struct DebounceQueue<K> {
    pending: HashMap<K, Instant>,
}

impl<K> Default for DebounceQueue<K> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Ord + Clone> DebounceQueue<K> {
    pub fn mark(&mut self, key: K, now: Instant) {
        self.pending.insert(key, now);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn next_due(&self, debounce: Duration) -> Option<Instant> {
        self.pending
            .values()
            .min()
            .map(|last_seen| *last_seen + debounce)
    }

    pub fn drain_due(&mut self, now: Instant, debounce: Duration) -> Vec<K> {
        let mut due = Vec::new();

        self.pending.retain(|key, last_seen| {
            if now.duration_since(*last_seen) >= debounce {
                due.push(key.clone());
                false
            } else {
                true
            }
        });

        due.sort();
        due
    }
}

/// Receives one merged diff per channel once its window closes.
pub trait NotificationSink<C, R> {
    fn deliver(
        &mut self,
        channel: &str,
        diff: &DiffReport,
        context: &C,
        reply_to: Option<&R>,
    ) -> Result<()>;
}

impl<C, R, F> NotificationSink<C, R> for F
where
    F: FnMut(&str, &DiffReport, &C, Option<&R>) -> Result<()>,
{
    fn deliver(
        &mut self,
        channel: &str,
        diff: &DiffReport,
        context: &C,
        reply_to: Option<&R>,
    ) -> Result<()> {
        self(channel, diff, context, reply_to)
    }
}

#[derive(Debug)]
struct PendingBatch<C, R> {
    scopes: BTreeSet<String>,
    keys: BTreeMap<(String, String), Option<String>>,
    entity_types: BTreeSet<(String, String)>,
    context: C,
    reply_to: Option<R>,
}

impl<C, R> PendingBatch<C, R> {
    fn new(context: C, reply_to: Option<R>) -> Self {
        Self {
            scopes: BTreeSet::new(),
            keys: BTreeMap::new(),
            entity_types: BTreeSet::new(),
            context,
            reply_to,
        }
    }

    fn merge(&mut self, diff: DiffReport) {
        self.scopes.extend(diff.scopes);

        for KeyDiff { scope, key, sample } in diff.keys {
            let slot = self.keys.entry((scope, key)).or_insert(None);
            if slot.is_none() {
                *slot = sample;
            }
        }

        self.entity_types.extend(
            diff.entity_types
                .into_iter()
                .map(|diff| (diff.scope, diff.entity_type)),
        );
    }

    fn into_parts(self) -> (DiffReport, C, Option<R>) {
        let diff = DiffReport {
            scopes: self.scopes.into_iter().collect(),
            keys: self
                .keys
                .into_iter()
                .map(|((scope, key), sample)| KeyDiff { scope, key, sample })
                .collect(),
            entity_types: self
                .entity_types
                .into_iter()
                .map(|(scope, entity_type)| EntityTypeDiff { scope, entity_type })
                .collect(),
        };
        (diff, self.context, self.reply_to)
    }
}

/// Per-channel batching of diffs. A channel is idle until something is queued,
/// pending until its quiet window elapses (each queue call restarts the
/// window), then delivered once and idle again.
pub struct Notifier<C, R, S> {
    window: Duration,
    clock: Arc<dyn Clock>,
    sink: S,
    batches: HashMap<String, PendingBatch<C, R>>,
    deadlines: DebounceQueue<String>,
}

impl<C, R, S> Notifier<C, R, S>
where
    S: NotificationSink<C, R>,
{
    pub fn new(window: Duration, clock: Arc<dyn Clock>, sink: S) -> Self {
        Self {
            window,
            clock,
            sink,
            batches: HashMap::new(),
            deadlines: DebounceQueue::default(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Merges `diff` into the channel's pending batch. The latest `context`
    /// replaces the stored one; `reply_to` only replaces it when given.
    pub fn queue(&mut self, channel: &str, diff: DiffReport, context: C, reply_to: Option<R>) {
        if diff.is_empty() {
            return;
        }

        match self.batches.entry(channel.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let batch = occupied.get_mut();
                batch.merge(diff);
                batch.context = context;
                if reply_to.is_some() {
                    batch.reply_to = reply_to;
                }
            }
            Entry::Vacant(vacant) => {
                let mut batch = PendingBatch::new(context, reply_to);
                batch.merge(diff);
                vacant.insert(batch);
            }
        }

        self.deadlines.mark(channel.to_owned(), self.clock.now());
    }

    /// Delivers every batch whose window has elapsed. Returns how many were delivered.
    pub fn poll(&mut self) -> usize {
        let mut delivered = 0;
        for channel in self.deadlines.drain_due(self.clock.now(), self.window) {
            if self.deliver(&channel) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn flush(&mut self, channel: &str) -> bool {
        self.deadlines.remove(&channel.to_owned());
        self.deliver(channel)
    }

    pub fn flush_all(&mut self) -> usize {
        let mut delivered = 0;
        for channel in self.pending_channels() {
            if self.flush(&channel) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn has_pending(&self, channel: &str) -> bool {
        self.batches.contains_key(channel)
    }

    pub fn pending_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.batches.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.next_due(self.window)
    }

    fn deliver(&mut self, channel: &str) -> bool {
        let Some(batch) = self.batches.remove(channel) else {
            return false;
        };
        let (diff, context, reply_to) = batch.into_parts();

        match self
            .sink
            .deliver(channel, &diff, &context, reply_to.as_ref())
        {
            Ok(()) => tracing::debug!(channel = %channel, items = diff.len(), "notification delivered"),
            Err(err) => tracing::error!(
                channel = %channel,
                items = diff.len(),
                error = %err,
                "notification delivery failed, batch dropped"
            ),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use shapewatch_core::ManualClock;

    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    #[derive(Debug, Default)]
    struct RecordingSink {
        deliveries: Vec<(String, DiffReport, &'static str, Option<u32>)>,
        fail: bool,
    }

    impl NotificationSink<&'static str, u32> for RecordingSink {
        fn deliver(
            &mut self,
            channel: &str,
            diff: &DiffReport,
            context: &&'static str,
            reply_to: Option<&u32>,
        ) -> Result<()> {
            self.deliveries
                .push((channel.to_owned(), diff.clone(), *context, reply_to.copied()));
            if self.fail {
                bail!("chat unavailable");
            }
            Ok(())
        }
    }

    fn notifier(clock: &Arc<ManualClock>) -> Notifier<&'static str, u32, RecordingSink> {
        let clock: Arc<dyn Clock> = Arc::clone(clock) as Arc<dyn Clock>;
        Notifier::new(WINDOW, clock, RecordingSink::default())
    }

    fn scopes(names: &[&str]) -> DiffReport {
        DiffReport {
            scopes: names.iter().map(|name| (*name).to_owned()).collect(),
            ..DiffReport::default()
        }
    }

    fn key(scope: &str, key: &str, sample: Option<&str>) -> DiffReport {
        DiffReport {
            keys: vec![KeyDiff {
                scope: scope.to_owned(),
                key: key.to_owned(),
                sample: sample.map(str::to_owned),
            }],
            ..DiffReport::default()
        }
    }

    #[test]
    fn interleaved_channels_become_due_in_their_own_windows() {
        let mut deadlines = DebounceQueue::default();
        let start = Instant::now();
        let at = |ms: u64| start + Duration::from_millis(ms);

        deadlines.mark("chat-b".to_owned(), at(0));
        deadlines.mark("chat-a".to_owned(), at(50));
        deadlines.mark("chat-b".to_owned(), at(200));
        assert_eq!(deadlines.next_due(WINDOW), Some(at(350)));

        assert_eq!(deadlines.drain_due(at(349), WINDOW), Vec::<String>::new());
        assert_eq!(deadlines.drain_due(at(350), WINDOW), vec!["chat-a"]);
        assert!(deadlines.contains(&"chat-b".to_owned()));

        deadlines.mark("chat-a".to_owned(), at(450));
        assert_eq!(
            deadlines.drain_due(at(800), WINDOW),
            vec!["chat-a", "chat-b"]
        );
        assert!(deadlines.next_due(WINDOW).is_none());
    }

    #[test]
    fn diffs_within_window_are_merged_into_one_delivery() {
        let clock = Arc::new(ManualClock::new());
        let mut notifier = notifier(&clock);

        notifier.queue("chat", scopes(&["scopeB"]), "first", Some(1));
        clock.advance(Duration::from_millis(100));
        notifier.queue("chat", scopes(&["scopeA", "scopeB"]), "second", None);
        assert!(notifier.has_pending("chat"));

        clock.advance(WINDOW);
        assert_eq!(notifier.poll(), 1);
        assert!(!notifier.has_pending("chat"));

        let deliveries = &notifier.sink().deliveries;
        assert_eq!(deliveries.len(), 1);
        let (channel, diff, context, reply_to) = &deliveries[0];
        assert_eq!(channel, "chat");
        assert_eq!(diff.scopes, vec!["scopeA", "scopeB"]);
        assert_eq!(*context, "second");
        assert_eq!(*reply_to, Some(1));
    }

    #[test]
    fn explicit_reply_to_replaces_the_stored_one() {
        let clock = Arc::new(ManualClock::new());
        let mut notifier = notifier(&clock);

        notifier.queue("chat", scopes(&["a"]), "first", Some(1));
        notifier.queue("chat", scopes(&["b"]), "second", Some(2));
        notifier.queue("chat", scopes(&["c"]), "third", None);
        assert!(notifier.flush("chat"));

        let (_, diff, context, reply_to) = &notifier.sink().deliveries[0];
        assert_eq!(diff.scopes, vec!["a", "b", "c"]);
        assert_eq!(*context, "third");
        assert_eq!(*reply_to, Some(2));
    }

    #[test]
    fn each_queue_call_restarts_the_window() {
        let clock = Arc::new(ManualClock::new());
        let mut notifier = notifier(&clock);

        notifier.queue("chat", scopes(&["a"]), "ctx", None);
        clock.advance(Duration::from_millis(250));
        notifier.queue("chat", scopes(&["b"]), "ctx", None);

        clock.advance(Duration::from_millis(250));
        assert_eq!(notifier.poll(), 0);

        clock.advance(Duration::from_millis(50));
        assert_eq!(notifier.poll(), 1);
        assert_eq!(clock.elapsed(), Duration::from_millis(550));
    }

    #[test]
    fn earlier_sample_is_kept_and_missing_sample_is_filled() {
        let clock = Arc::new(ManualClock::new());
        let mut notifier = notifier(&clock);

        notifier.queue("chat", key("message", "text", Some("first")), "ctx", None);
        notifier.queue("chat", key("message", "text", Some("second")), "ctx", None);
        notifier.queue("chat", key("message", "chat", None), "ctx", None);
        notifier.queue("chat", key("message", "chat", Some("filled")), "ctx", None);
        notifier.flush("chat");

        let diff = &notifier.sink().deliveries[0].1;
        let samples: Vec<(&str, Option<&str>)> = diff
            .keys
            .iter()
            .map(|key| (key.key.as_str(), key.sample.as_deref()))
            .collect();
        assert_eq!(samples, vec![("chat", Some("filled")), ("text", Some("first"))]);
    }

    #[test]
    fn merged_content_does_not_depend_on_queue_order() {
        let clock = Arc::new(ManualClock::new());
        let diffs = [
            scopes(&["album"]),
            key("message", "text", None),
            DiffReport {
                entity_types: vec![EntityTypeDiff {
                    scope: "message".to_owned(),
                    entity_type: "spoiler".to_owned(),
                }],
                ..scopes(&["message"])
            },
        ];

        let mut forward = notifier(&clock);
        for diff in diffs.iter().cloned() {
            forward.queue("chat", diff, "ctx", None);
        }
        let mut backward = notifier(&clock);
        for diff in diffs.iter().rev().cloned() {
            backward.queue("chat", diff, "ctx", None);
        }
        forward.flush_all();
        backward.flush_all();

        assert_eq!(forward.sink().deliveries[0].1, backward.sink().deliveries[0].1);
    }

    #[test]
    fn channels_are_delivered_independently() {
        let clock = Arc::new(ManualClock::new());
        let mut notifier = notifier(&clock);

        notifier.queue("a", scopes(&["x"]), "ctx", None);
        clock.advance(Duration::from_millis(200));
        notifier.queue("b", scopes(&["y"]), "ctx", None);

        clock.advance(Duration::from_millis(100));
        assert_eq!(notifier.poll(), 1);
        assert_eq!(notifier.pending_channels(), vec!["b"]);

        assert_eq!(notifier.flush_all(), 1);
        assert!(notifier.pending_channels().is_empty());
    }

    #[test]
    fn failed_delivery_is_swallowed_and_channel_recovers() {
        let clock = Arc::new(ManualClock::new());
        let mut notifier = notifier(&clock);
        notifier.sink_mut().fail = true;

        notifier.queue("chat", scopes(&["a"]), "ctx", None);
        assert!(notifier.flush("chat"));
        assert!(!notifier.has_pending("chat"));

        notifier.sink_mut().fail = false;
        notifier.queue("chat", scopes(&["b"]), "ctx", None);
        clock.advance(WINDOW);
        assert_eq!(notifier.poll(), 1);
        assert_eq!(notifier.sink().deliveries.len(), 2);
        assert_eq!(notifier.sink().deliveries[1].1.scopes, vec!["b"]);
    }

    #[test]
    fn empty_diff_does_not_open_a_batch() {
        let clock = Arc::new(ManualClock::new());
        let mut notifier = notifier(&clock);

        notifier.queue("chat", DiffReport::default(), "ctx", None);

        assert!(!notifier.has_pending("chat"));
        assert!(!notifier.flush("chat"));
        assert!(notifier.next_deadline().is_none());
    }
}
