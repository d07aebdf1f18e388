//! Rate-limited, coalescing outbound queue.
//!
//! Entries wait in FIFO order. A new entry whose merge key matches the
//! tail folds into it instead of queueing behind it. A dispatcher task
//! drains at most one rendered entry per tick, and only while the gate
//! (the chat connection being ready) is open.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Something the queue can hold and coalesce.
pub trait Deliverable: Send + 'static {
    type Key: PartialEq;
    type Output: Send;

    /// Entries with equal keys merge when adjacent at the tail. `None`
    /// never merges.
    fn merge_key(&self) -> Option<Self::Key>;
    fn merge_with(self, later: Self) -> Self;
    /// What actually gets sent; `None` means the entry is dropped.
    fn render(&self) -> Option<Self::Output>;
}

#[async_trait]
pub trait DeliverySink<T>: Send + Sync {
    type Error: Display + Send;

    async fn deliver(&self, item: T) -> Result<(), Self::Error>;
}

#[derive(Debug)]
pub struct QueueEntry<P> {
    /// Earliest time a lone head may be sent. `None` is always due.
    pub due_at: Option<Instant>,
    pub payload: P,
}

impl<P> QueueEntry<P> {
    pub fn now(payload: P) -> Self {
        Self {
            due_at: None,
            payload,
        }
    }

    pub fn at(due_at: Instant, payload: P) -> Self {
        Self {
            due_at: Some(due_at),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Appended,
    Merged,
}

#[derive(Debug)]
pub struct DispatchQueue<P> {
    entries: VecDeque<QueueEntry<P>>,
}

impl<P> Default for DispatchQueue<P> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<P: Deliverable> DispatchQueue<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enqueue(&mut self, entry: QueueEntry<P>) -> Enqueued {
        let merges = match (self.entries.back(), entry.payload.merge_key()) {
            (Some(tail), Some(key)) => tail
                .payload
                .merge_key()
                .is_some_and(|tail_key| tail_key == key),
            _ => false,
        };
        if merges {
            if let Some(tail) = self.entries.pop_back() {
                // A merge may push the due time back, never forward.
                self.entries.push_back(QueueEntry {
                    due_at: tail.due_at.max(entry.due_at),
                    payload: tail.payload.merge_with(entry.payload),
                });
                return Enqueued::Merged;
            }
        }
        self.entries.push_back(entry);
        Enqueued::Appended
    }

    /// Removes the head if it may be sent at `now`.
    ///
    /// A head with entries behind it is always ready: nothing else can
    /// merge into it any more. A lone head waits for its due time.
    pub fn pop_ready(&mut self, now: Instant) -> Option<P> {
        let head = self.entries.front()?;
        let lone = self.entries.len() == 1;
        if lone && head.due_at.is_some_and(|due| due > now) {
            return None;
        }
        self.entries.pop_front().map(|entry| entry.payload)
    }
}

#[derive(Debug, Error)]
#[error("dispatcher stopped")]
pub struct DispatchClosed;

/// Cloneable producer side of a running dispatcher.
#[derive(Debug)]
pub struct DispatchHandle<P> {
    entries: mpsc::UnboundedSender<QueueEntry<P>>,
}

impl<P> Clone for DispatchHandle<P> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<P> DispatchHandle<P> {
    pub fn enqueue(&self, entry: QueueEntry<P>) -> Result<(), DispatchClosed> {
        self.entries.send(entry).map_err(|_| DispatchClosed)
    }
}

/// Starts the dispatcher. It stops once every handle is dropped.
pub fn spawn_dispatcher<P, S>(
    sink: Arc<S>,
    tick: Duration,
    gate: watch::Receiver<bool>,
) -> (DispatchHandle<P>, JoinHandle<()>)
where
    P: Deliverable,
    S: DeliverySink<P::Output> + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_dispatcher(rx, sink, tick, gate));
    (DispatchHandle { entries: tx }, task)
}

async fn run_dispatcher<P, S>(
    mut entries: mpsc::UnboundedReceiver<QueueEntry<P>>,
    sink: Arc<S>,
    tick: Duration,
    gate: watch::Receiver<bool>,
) where
    P: Deliverable,
    S: DeliverySink<P::Output>,
{
    let mut queue = DispatchQueue::new();
    let mut ticker = time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            entry = entries.recv() => match entry {
                Some(entry) => {
                    let outcome = queue.enqueue(entry);
                    trace!(
                        target = "dispatch",
                        ?outcome,
                        depth = queue.len(),
                        "queued outbound entry"
                    );
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !*gate.borrow() {
                    continue;
                }
                deliver_one(&mut queue, sink.as_ref()).await;
            }
        }
    }
    if !queue.is_empty() {
        debug!(
            target = "dispatch",
            dropped = queue.len(),
            "dispatcher stopped with undelivered entries"
        );
    }
}

/// Sends the first ready entry that renders to something.
async fn deliver_one<P, S>(queue: &mut DispatchQueue<P>, sink: &S)
where
    P: Deliverable,
    S: DeliverySink<P::Output> + ?Sized,
{
    while let Some(payload) = queue.pop_ready(Instant::now()) {
        let Some(output) = payload.render() else {
            debug!(target = "dispatch", "dropping entry with nothing to report");
            continue;
        };
        if let Err(err) = sink.deliver(output).await {
            warn!(target = "dispatch", error = %err, "delivery failed");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        key: Option<&'static str>,
        text: String,
    }

    fn note(key: &'static str, text: &str) -> Note {
        Note {
            key: Some(key),
            text: text.to_string(),
        }
    }

    impl Deliverable for Note {
        type Key = &'static str;
        type Output = String;

        fn merge_key(&self) -> Option<Self::Key> {
            self.key
        }

        fn merge_with(self, later: Self) -> Self {
            Note {
                key: later.key,
                text: format!("{}{}", self.text, later.text),
            }
        }

        fn render(&self) -> Option<String> {
            (!self.text.is_empty()).then(|| self.text.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliverySink<String> for Recorder {
        type Error = std::convert::Infallible;

        async fn deliver(&self, item: String) -> Result<(), Self::Error> {
            self.sent.lock().push(item);
            Ok(())
        }
    }

    #[test]
    fn adjacent_same_key_entries_merge() {
        let mut queue = DispatchQueue::new();
        assert_eq!(queue.enqueue(QueueEntry::now(note("a", "1"))), Enqueued::Appended);
        assert_eq!(queue.enqueue(QueueEntry::now(note("a", "2"))), Enqueued::Merged);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_ready(Instant::now()).unwrap().text, "12");
    }

    #[test]
    fn only_the_tail_absorbs_merges() {
        let mut queue = DispatchQueue::new();
        queue.enqueue(QueueEntry::now(note("a", "1")));
        queue.enqueue(QueueEntry::now(note("b", "x")));
        assert_eq!(queue.enqueue(QueueEntry::now(note("a", "2"))), Enqueued::Appended);

        let now = Instant::now();
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_ready(now))
            .map(|n| n.text)
            .collect();
        assert_eq!(order, vec!["1", "x", "2"]);
    }

    #[test]
    fn keyless_entries_never_merge() {
        let mut queue = DispatchQueue::new();
        let keyless = Note {
            key: None,
            text: "join".into(),
        };
        queue.enqueue(QueueEntry::now(keyless.clone()));
        assert_eq!(queue.enqueue(QueueEntry::now(keyless)), Enqueued::Appended);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn lone_head_waits_until_due() {
        let mut queue = DispatchQueue::new();
        let now = Instant::now();
        queue.enqueue(QueueEntry::at(now + Duration::from_secs(5), note("a", "1")));
        assert!(queue.pop_ready(now).is_none());
        assert!(queue.pop_ready(now + Duration::from_secs(4)).is_none());
        assert_eq!(
            queue.pop_ready(now + Duration::from_secs(5)).unwrap().text,
            "1"
        );
    }

    #[test]
    fn head_with_followers_is_sent_early() {
        let mut queue = DispatchQueue::new();
        let now = Instant::now();
        let later = now + Duration::from_secs(60);
        queue.enqueue(QueueEntry::at(later, note("a", "1")));
        queue.enqueue(QueueEntry::at(later, note("b", "2")));
        assert_eq!(queue.pop_ready(now).unwrap().text, "1");
        assert!(queue.pop_ready(now).is_none());
    }

    #[test]
    fn merge_extends_the_due_time() {
        let mut queue = DispatchQueue::new();
        let now = Instant::now();
        queue.enqueue(QueueEntry::at(now + Duration::from_secs(1), note("a", "1")));
        queue.enqueue(QueueEntry::at(now + Duration::from_secs(3), note("a", "2")));
        assert!(queue.pop_ready(now + Duration::from_secs(2)).is_none());
        assert!(queue.pop_ready(now + Duration::from_secs(3)).is_some());
    }

    #[test]
    fn late_merge_with_earlier_due_time_keeps_the_window() {
        let mut queue = DispatchQueue::new();
        let now = Instant::now();
        queue.enqueue(QueueEntry::at(now + Duration::from_secs(3), note("a", "1")));
        queue.enqueue(QueueEntry::at(now + Duration::from_secs(1), note("a", "2")));
        queue.enqueue(QueueEntry::now(note("a", "3")));
        assert!(queue.pop_ready(now + Duration::from_secs(2)).is_none());
        assert_eq!(
            queue.pop_ready(now + Duration::from_secs(3)).unwrap().text,
            "123"
        );
    }

    #[test]
    fn insertion_order_beats_due_order() {
        let mut queue = DispatchQueue::new();
        let now = Instant::now();
        queue.enqueue(QueueEntry::at(now + Duration::from_secs(30), note("e1", "E1")));
        assert!(queue.pop_ready(now).is_none());

        queue.enqueue(QueueEntry::at(now, note("e2", "E2")));
        assert_eq!(queue.pop_ready(now).unwrap().text, "E1");
        assert_eq!(queue.pop_ready(now).unwrap().text, "E2");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_sends_one_entry_per_tick() {
        let sink = Arc::new(Recorder::default());
        let (_gate_tx, gate) = watch::channel(true);
        let (handle, _task) = spawn_dispatcher(sink.clone(), Duration::from_secs(1), gate);

        for (key, text) in [("a", "1"), ("b", "2"), ("c", "3")] {
            handle.enqueue(QueueEntry::now(note(key, text))).unwrap();
        }
        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.sent.lock().len(), 1);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*sink.sent.lock(), vec!["1", "2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_gate_holds_entries() {
        let sink = Arc::new(Recorder::default());
        let (gate_tx, gate) = watch::channel(false);
        let (handle, _task) = spawn_dispatcher(sink.clone(), Duration::from_secs(1), gate);

        handle.enqueue(QueueEntry::now(note("a", "1"))).unwrap();
        time::sleep(Duration::from_secs(5)).await;
        assert!(sink.sent.lock().is_empty());

        gate_tx.send_replace(true);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*sink.sent.lock(), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_renders_are_skipped_without_losing_the_tick() {
        let sink = Arc::new(Recorder::default());
        let (_gate_tx, gate) = watch::channel(true);
        let (handle, _task) = spawn_dispatcher(sink.clone(), Duration::from_secs(1), gate);

        handle.enqueue(QueueEntry::now(note("a", ""))).unwrap();
        handle.enqueue(QueueEntry::now(note("b", "kept"))).unwrap();
        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*sink.sent.lock(), vec!["kept"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_stops_when_handles_drop() {
        let sink = Arc::new(Recorder::default());
        let (_gate_tx, gate) = watch::channel(true);
        let (handle, task) =
            spawn_dispatcher::<Note, _>(sink, Duration::from_secs(1), gate);
        drop(handle);
        time::timeout(Duration::from_secs(5), task)
            .await
            .expect("dispatcher exits")
            .unwrap();
    }
}
