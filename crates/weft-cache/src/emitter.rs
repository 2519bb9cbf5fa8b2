#![forbid(unsafe_code)]

//! Deferred, batched observer notification.
//!
//! The emitter collects entries marked dirty during synchronous work and runs
//! their observer callbacks once per tick.
//!
//! # State machine
//!
//! ```text
//!            dispatch                 flush begins
//!   Idle ─────────────────▶ Scheduled ─────────────▶ Flushing
//!    ▲                          ▲                       │
//!    │      nothing pending     │  dispatched during    │
//!    └──────────────────────────┴───── the flush ◀──────┘
//! ```
//!
//! Going `Idle -> Scheduled` notifies the configured [`FlushScheduler`] once;
//! further dispatches in the same tick only extend the pending set. A dispatch
//! that arrives while a flush runs is deferred to the next tick, which is
//! scheduled after the current flush completes.
//!
//! # Failure isolation
//!
//! A callback that returns an error or panics is logged and counted; the
//! remaining callbacks of the batch still run.
//!
//! # Removal during a flush
//!
//! A flush iterates a snapshot of each entry's listener list. Unsubscribing
//! deactivates the listener immediately, so removals made by a callback never
//! shift, skip, or repeat the other listeners of the snapshot.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::error::Result;
use crate::key::{Key, OwnerId};
use crate::store::EntryId;

/// Hook invoked when the emitter goes from idle to scheduled.
///
/// The host's event loop should call [`Cache::flush`](crate::Cache::flush) on
/// its next iteration (the "next tick").
pub trait FlushScheduler {
    fn schedule(&self);
}

impl<F: Fn()> FlushScheduler for F {
    fn schedule(&self) {
        self();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitterState {
    /// No pending notifications.
    #[default]
    Idle,
    /// Pending notifications; a flush has been requested.
    Scheduled,
    /// A flush is running.
    Flushing,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    /// Dirty entries processed.
    pub entries: usize,
    /// Callbacks invoked.
    pub callbacks: usize,
    /// Callbacks that returned an error or panicked.
    pub failures: usize,
}

pub(crate) type Callback = Box<dyn FnMut() -> Result<()>>;

pub(crate) struct Listener {
    id: u64,
    owner: OwnerId,
    key: Key,
    active: Cell<bool>,
    callback: RefCell<Callback>,
}

impl Listener {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("active", &self.active.get())
            .finish()
    }
}

pub(crate) type Batch = Vec<(EntryId, Vec<Rc<Listener>>)>;

#[derive(Default)]
pub(crate) struct Emitter {
    state: EmitterState,
    /// Dirty entries in insertion order.
    pending: Vec<EntryId>,
    queued: AHashSet<EntryId>,
    listeners: AHashMap<EntryId, Vec<Rc<Listener>>>,
    /// Entry whose listeners are running, while flushing.
    current: Option<EntryId>,
    next_listener: u64,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> EmitterState {
        self.state
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn subscribe(
        &mut self,
        entry: EntryId,
        owner: OwnerId,
        key: Key,
        callback: Callback,
    ) -> u64 {
        self.next_listener += 1;
        let id = self.next_listener;
        self.listeners.entry(entry).or_default().push(Rc::new(Listener {
            id,
            owner,
            key,
            active: Cell::new(true),
            callback: RefCell::new(callback),
        }));
        id
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub(crate) fn unsubscribe(&mut self, entry: EntryId, listener: u64) -> bool {
        let Some(list) = self.listeners.get_mut(&entry) else {
            return false;
        };
        let Some(pos) = list.iter().position(|l| l.id() == listener) else {
            return false;
        };
        let removed = list.remove(pos);
        removed.active.set(false);
        if list.is_empty() {
            self.listeners.remove(&entry);
        }
        true
    }

    /// Queue `entry` for the next flush.
    ///
    /// `during_read` marks dispatches caused by a recomputation. A listener
    /// that re-reads its own entry recomputes it, and that change is the one
    /// being delivered, so it is not queued again.
    ///
    /// Returns `true` when this call moved the emitter from idle to scheduled;
    /// the caller must then notify the scheduler (outside any borrow).
    pub(crate) fn dispatch(&mut self, entry: EntryId, during_read: bool) -> bool {
        if during_read && self.current == Some(entry) {
            return false;
        }
        if self.queued.insert(entry) {
            self.pending.push(entry);
        }
        if self.state == EmitterState::Idle {
            self.state = EmitterState::Scheduled;
            return true;
        }
        false
    }

    /// Take the pending set and the listeners to run for it.
    ///
    /// Returns `None` if a flush is already running or nothing is scheduled.
    pub(crate) fn begin_flush(&mut self) -> Option<Batch> {
        if self.state != EmitterState::Scheduled {
            return None;
        }
        self.state = EmitterState::Flushing;
        self.queued.clear();
        let pending = std::mem::take(&mut self.pending);
        Some(
            pending
                .into_iter()
                .map(|entry| {
                    let listeners = self.listeners.get(&entry).cloned().unwrap_or_default();
                    (entry, listeners)
                })
                .collect(),
        )
    }

    /// Finish a flush. Returns `true` if work dispatched during the flush
    /// requires scheduling another tick.
    pub(crate) fn end_flush(&mut self) -> bool {
        self.current = None;
        if self.pending.is_empty() {
            self.state = EmitterState::Idle;
            false
        } else {
            self.state = EmitterState::Scheduled;
            true
        }
    }

    /// Drop listeners and pending notifications of removed entries.
    pub(crate) fn purge(&mut self, entries: &[EntryId]) {
        for entry in entries {
            if let Some(list) = self.listeners.remove(entry) {
                for listener in list {
                    listener.active.set(false);
                }
            }
            if self.queued.remove(entry) {
                self.pending.retain(|e| e != entry);
            }
        }
        if self.state == EmitterState::Scheduled && self.pending.is_empty() {
            self.state = EmitterState::Idle;
        }
    }
}

/// Invoke every active listener of the batch, isolating failures.
///
/// `emitter` is only borrowed between callbacks, never across one.
pub(crate) fn run_batch(emitter: &RefCell<Emitter>, batch: Batch) -> FlushReport {
    let mut report = FlushReport {
        entries: batch.len(),
        ..FlushReport::default()
    };
    for (entry, listeners) in batch {
        emitter.borrow_mut().current = Some(entry);
        for listener in listeners {
            if !listener.active.get() {
                continue;
            }
            let Ok(mut guard) = listener.callback.try_borrow_mut() else {
                continue;
            };
            let callback: &mut dyn FnMut() -> Result<()> = &mut **guard;
            report.callbacks += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    report.failures += 1;
                    tracing::warn!(
                        owner = %listener.owner,
                        key = %listener.key,
                        error = %err,
                        "observer callback failed"
                    );
                }
                Err(payload) => {
                    report.failures += 1;
                    tracing::warn!(
                        owner = %listener.owner,
                        key = %listener.key,
                        panic = panic_message(payload.as_ref()),
                        "observer callback panicked"
                    );
                }
            }
        }
    }
    emitter.borrow_mut().current = None;
    report
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::store::Store;

    fn setup(n: usize) -> (Vec<EntryId>, OwnerId) {
        let mut store = Store::new();
        let owner = store.create_owner();
        let ids = (0..n)
            .map(|i| store.resolve(owner, Key::from(i)).unwrap())
            .collect();
        (ids, owner)
    }

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, name: &'static str) -> Callback {
        let log = Rc::clone(log);
        Box::new(move || {
            log.borrow_mut().push(name);
            Ok(())
        })
    }

    fn flush(emitter: &RefCell<Emitter>) -> FlushReport {
        let batch = emitter.borrow_mut().begin_flush().unwrap();
        let report = run_batch(emitter, batch);
        emitter.borrow_mut().end_flush();
        report
    }

    #[test]
    fn dispatch_schedules_once_per_tick() {
        let (ids, _) = setup(2);
        let mut emitter = Emitter::new();
        assert!(emitter.dispatch(ids[0], false));
        assert!(!emitter.dispatch(ids[1], false));
        assert!(!emitter.dispatch(ids[0], false));
        assert_eq!(emitter.pending_len(), 2);
        assert_eq!(emitter.state(), EmitterState::Scheduled);
    }

    #[test]
    fn flush_runs_in_insertion_order_then_idles() {
        let (ids, owner) = setup(2);
        let log = Rc::new(RefCell::new(Vec::new()));
        let emitter = RefCell::new(Emitter::new());
        {
            let mut e = emitter.borrow_mut();
            e.subscribe(ids[0], owner, Key::from(0usize), recorder(&log, "zero"));
            e.subscribe(ids[1], owner, Key::from(1usize), recorder(&log, "one"));
            e.dispatch(ids[1], false);
            e.dispatch(ids[0], false);
        }

        let report = flush(&emitter);

        assert_eq!(*log.borrow(), vec!["one", "zero"]);
        assert_eq!(report.entries, 2);
        assert_eq!(report.callbacks, 2);
        assert_eq!(emitter.borrow().state(), EmitterState::Idle);
    }

    #[test]
    fn idle_emitter_has_nothing_to_flush() {
        let (ids, _) = setup(1);
        let mut emitter = Emitter::new();
        assert!(emitter.begin_flush().is_none());
        assert_eq!(emitter.state(), EmitterState::Idle);

        emitter.dispatch(ids[0], false);
        emitter.purge(&ids);
        assert!(emitter.begin_flush().is_none());
    }

    #[test]
    fn dispatch_during_flush_defers_to_next_tick() {
        let (ids, _) = setup(1);
        let mut emitter = Emitter::new();
        emitter.dispatch(ids[0], false);
        let _batch = emitter.begin_flush().unwrap();
        assert_eq!(emitter.state(), EmitterState::Flushing);
        assert!(emitter.begin_flush().is_none());

        assert!(!emitter.dispatch(ids[0], false));
        assert!(emitter.end_flush());
        assert_eq!(emitter.state(), EmitterState::Scheduled);
        assert_eq!(emitter.pending_len(), 1);
    }

    #[test]
    fn recompute_of_current_entry_is_not_requeued() {
        let (ids, _) = setup(2);
        let mut emitter = Emitter::new();
        emitter.dispatch(ids[0], false);
        let _batch = emitter.begin_flush().unwrap();
        emitter.current = Some(ids[0]);

        assert!(!emitter.dispatch(ids[0], true));
        assert_eq!(emitter.pending_len(), 0);
        // Writes and other entries still queue.
        emitter.dispatch(ids[0], false);
        emitter.dispatch(ids[1], true);
        assert_eq!(emitter.pending_len(), 2);
    }

    #[test]
    fn failing_callbacks_do_not_block_others() {
        let (ids, owner) = setup(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        let emitter = RefCell::new(Emitter::new());
        {
            let mut e = emitter.borrow_mut();
            e.subscribe(
                ids[0],
                owner,
                Key::from(0usize),
                Box::new(|| -> Result<()> { Err(CacheError::compute("boom")) }),
            );
            e.subscribe(
                ids[0],
                owner,
                Key::from(0usize),
                Box::new(|| -> Result<()> { panic!("observer panicked") }),
            );
            e.subscribe(ids[0], owner, Key::from(0usize), recorder(&log, "ok"));
            e.dispatch(ids[0], false);
        }

        let report = flush(&emitter);

        assert_eq!(*log.borrow(), vec!["ok"]);
        assert_eq!(report.callbacks, 3);
        assert_eq!(report.failures, 2);
    }

    #[test]
    fn unsubscribed_listener_in_snapshot_is_skipped() {
        let (ids, owner) = setup(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        let emitter = RefCell::new(Emitter::new());
        let second = {
            let mut e = emitter.borrow_mut();
            e.subscribe(ids[0], owner, Key::from(0usize), recorder(&log, "first"));
            let second = e.subscribe(ids[0], owner, Key::from(0usize), recorder(&log, "second"));
            e.subscribe(ids[0], owner, Key::from(0usize), recorder(&log, "third"));
            e.dispatch(ids[0], false);
            second
        };

        let batch = emitter.borrow_mut().begin_flush().unwrap();
        assert!(emitter.borrow_mut().unsubscribe(ids[0], second));
        assert!(!emitter.borrow_mut().unsubscribe(ids[0], second));
        run_batch(&emitter, batch);
        emitter.borrow_mut().end_flush();

        assert_eq!(*log.borrow(), vec!["first", "third"]);
    }

    #[test]
    fn purge_drops_pending_and_listeners() {
        let (ids, owner) = setup(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut emitter = Emitter::new();
        let listener = emitter.subscribe(ids[0], owner, Key::from(0usize), recorder(&log, "x"));
        emitter.dispatch(ids[0], false);

        emitter.purge(&ids);
        assert_eq!(emitter.pending_len(), 0);
        assert_eq!(emitter.state(), EmitterState::Idle);
        assert!(!emitter.unsubscribe(ids[0], listener));
    }

    #[test]
    fn closures_are_schedulers() {
        let hits = Rc::new(Cell::new(0));
        let hits_clone = Rc::clone(&hits);
        let scheduler = move || hits_clone.set(hits_clone.get() + 1);
        scheduler.schedule();
        assert_eq!(hits.get(), 1);
    }
}
