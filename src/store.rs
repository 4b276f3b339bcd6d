//! The thread-safe knowledge store.
//!
//! One exclusive lock guards the whole aggregate: the record map, the
//! global Lamport clock and the modified-tracking sets. That coarseness is
//! load-bearing: conflict resolution inspects and updates the global clock
//! atomically with the per-key record, and the clock-monotonicity invariant
//! (`clock >= every stored record clock`) only holds under a single lock.
//!
//! Two entry points mutate records: [`KnowledgeStore::set`] for local
//! writes and [`KnowledgeStore::apply`] for everything that arrives from
//! outside; the transport receive path and checkpoint replay both funnel
//! through `apply`. Policy rejections are ordinary return values, never
//! errors: this is the hot path and callers branch on the outcome.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::{
    record::{Record, Scope, Status, Value},
    settings::UpdateSettings,
};

/// What happened to an update.
///
/// `LowQuality`, `StaleClock` and `EmptyKey` are expected, frequent and
/// non-fatal; callers branch on them.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The value was stored and waiters were signaled.
    Applied,
    /// The update was acceptable but the stored value is already identical;
    /// nothing was marked for re-dissemination.
    Unchanged,
    /// Rejected: the incoming quality is below the stored quality.
    LowQuality,
    /// Rejected: same quality but an older clock; a replay or out-of-order
    /// delivery.
    StaleClock,
    /// Rejected: the key was empty.
    EmptyKey,
}

impl UpdateOutcome {
    /// True for [`Applied`](UpdateOutcome::Applied) and
    /// [`Unchanged`](UpdateOutcome::Unchanged).
    pub fn accepted(self) -> bool {
        matches!(self, UpdateOutcome::Applied | UpdateOutcome::Unchanged)
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) records: BTreeMap<String, Record>,
    pub(crate) clock: u64,
    /// Wakeup epoch for [`KnowledgeStore::wait_for_change`].
    version: u64,
    /// Global keys changed since the last dissemination pass.
    pub(crate) send_modified: BTreeSet<String>,
    /// Global keys changed since the last checkpoint segment.
    pub(crate) ckpt_modified: BTreeSet<String>,
    /// Local keys changed since the last checkpoint segment.
    pub(crate) ckpt_modified_local: BTreeSet<String>,
}

impl State {
    fn materialize(&mut self, key: &str) -> &mut Record {
        self.records.entry(key.to_owned()).or_insert_with(|| Record {
            scope: Scope::of_key(key),
            ..Default::default()
        })
    }

    fn mark_modified(&mut self, key: &str, scope: Scope, treat_globals_as_locals: bool) {
        match scope {
            Scope::Global => {
                self.ckpt_modified.insert(key.to_owned());
                if !treat_globals_as_locals {
                    self.send_modified.insert(key.to_owned());
                }
            }
            Scope::Local => {
                self.ckpt_modified_local.insert(key.to_owned());
            }
        }
    }
}

/// The concurrent knowledge store.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug, Default)]
pub struct KnowledgeStore {
    state: Mutex<State>,
    changed: Condvar,
}

impl KnowledgeStore {
    /// An empty store at clock zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    pub(crate) fn notify(&self, state: &mut State) {
        state.version += 1;
        self.changed.notify_all();
    }

    /// Returns the record for `key`, materializing an uncreated
    /// integer-zero record on first reference.
    pub fn get(&self, key: &str) -> Record {
        if key.is_empty() {
            return Record::default();
        }
        let mut state = self.state();
        state.materialize(key).clone()
    }

    /// Whether `key` has ever been referenced.
    pub fn exists(&self, key: &str) -> bool {
        self.state().records.contains_key(key)
    }

    /// Local write.
    ///
    /// Rejected with [`UpdateOutcome::LowQuality`] when this process's
    /// write quality for the key is below the quality of the value it
    /// already holds, unless `settings.always_overwrite` is set. An
    /// accepted write takes the write quality as the new quality, stamps
    /// the advanced global clock and wakes waiters.
    pub fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
        settings: &UpdateSettings,
    ) -> UpdateOutcome {
        if key.is_empty() {
            return UpdateOutcome::EmptyKey;
        }
        let value = value.into();
        let scope = Scope::of_key(key);
        let mut guard = self.state();
        let state = &mut *guard;

        if !settings.always_overwrite {
            if let Some(record) = state.records.get(key) {
                if record.write_quality < record.quality {
                    trace!(
                        key,
                        write_quality = record.write_quality,
                        quality = record.quality,
                        "local write rejected: quality too low"
                    );
                    return UpdateOutcome::LowQuality;
                }
            }
        }

        state.clock += settings.clock_increment;
        let clock = state.clock;
        let record = state.materialize(key);
        record.value = value;
        record.quality = record.write_quality;
        record.clock = clock;
        record.status = Status::Modified;
        state.mark_modified(key, scope, settings.treat_globals_as_locals);

        if settings.signal {
            self.notify(state);
        }
        UpdateOutcome::Applied
    }

    /// External update: the single choke point for values arriving off the
    /// wire or out of a checkpoint.
    ///
    /// Quality gates first, then the clock within equal quality, then a
    /// bit-exact no-change test. The global clock advances on *every*
    /// outcome except an empty key: even a rejected update proves that
    /// logical time has reached its clock, and later local writes must be
    /// stamped after anything already seen.
    pub fn apply(&self, key: &str, incoming: Record, settings: &UpdateSettings) -> UpdateOutcome {
        let mut state = self.state();
        self.apply_with_state(&mut state, key, incoming, settings)
    }

    pub(crate) fn apply_with_state(
        &self,
        state: &mut State,
        key: &str,
        incoming: Record,
        settings: &UpdateSettings,
    ) -> UpdateOutcome {
        if key.is_empty() {
            trace!("external update rejected: empty key");
            return UpdateOutcome::EmptyKey;
        }

        // an absent key participates as lowest quality and clock
        let (found_quality, found_clock, same_value) = match state.records.get(key) {
            Some(record) => (
                record.quality,
                record.clock,
                record.value == incoming.value,
            ),
            None => (0, 0, false),
        };

        let outcome = if !settings.always_overwrite && incoming.quality < found_quality {
            UpdateOutcome::LowQuality
        } else if !settings.always_overwrite
            && incoming.quality == found_quality
            && incoming.clock < found_clock
        {
            UpdateOutcome::StaleClock
        } else if same_value {
            UpdateOutcome::Unchanged
        } else {
            UpdateOutcome::Applied
        };

        // the clock advances even for rejected updates
        state.clock = match outcome {
            UpdateOutcome::Applied | UpdateOutcome::Unchanged => {
                state.clock.max(incoming.clock.saturating_add(1))
            }
            _ => state.clock.max(incoming.clock),
        };

        match outcome {
            UpdateOutcome::LowQuality => {
                debug!(
                    key,
                    incoming = incoming.quality,
                    stored = found_quality,
                    "update rejected: quality too low"
                );
            }
            UpdateOutcome::StaleClock => {
                debug!(
                    key,
                    incoming = incoming.clock,
                    stored = found_clock,
                    "update rejected: stale clock"
                );
            }
            UpdateOutcome::Unchanged => {
                let record = state.materialize(key);
                record.quality = incoming.quality;
                record.clock = record.clock.max(incoming.clock);
                trace!(key, "update accepted with no change");
            }
            UpdateOutcome::Applied => {
                let scope = Scope::of_key(key);
                let record = state.materialize(key);
                record.value = incoming.value;
                record.quality = incoming.quality;
                record.clock = incoming.clock;
                record.status = Status::Modified;
                state.mark_modified(key, scope, settings.treat_globals_as_locals);
                trace!(key, clock = incoming.clock, quality = incoming.quality, "update applied");
                if settings.signal {
                    self.notify(state);
                }
            }
            UpdateOutcome::EmptyKey => unreachable!("checked above"),
        }
        outcome
    }

    /// Removes `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state();
        state.send_modified.remove(key);
        state.ckpt_modified.remove(key);
        state.ckpt_modified_local.remove(key);
        state.records.remove(key).is_some()
    }

    /// Removes every record. The clock is kept: logical time never runs
    /// backwards.
    pub fn clear(&self) {
        let mut state = self.state();
        state.records.clear();
        state.send_modified.clear();
        state.ckpt_modified.clear();
        state.ckpt_modified_local.clear();
        self.notify(&mut state);
    }

    /// Number of records, materialized ones included.
    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.state().records.keys().cloned().collect()
    }

    /// Snapshot of every record whose key starts with `prefix`.
    pub fn to_map(&self, prefix: &str) -> BTreeMap<String, Record> {
        self.state()
            .records
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect()
    }

    /// The global Lamport clock.
    pub fn clock(&self) -> u64 {
        self.state().clock
    }

    /// Merges `clock` into the global clock (max; never runs backwards).
    /// Returns the resulting clock.
    pub fn set_clock(&self, clock: u64) -> u64 {
        let mut state = self.state();
        state.clock = state.clock.max(clock);
        state.clock
    }

    /// Advances the global clock by `settings.clock_increment` and returns
    /// the new time. Intended for stamping outgoing batches.
    pub fn tick(&self, settings: &UpdateSettings) -> u64 {
        let mut state = self.state();
        state.clock += settings.clock_increment;
        state.clock
    }

    /// The clock of `key`'s record; zero when unset.
    pub fn get_clock(&self, key: &str) -> u64 {
        self.state().records.get(key).map(|r| r.clock).unwrap_or(0)
    }

    /// Sets the clock of `key`'s record, merging it into the global clock
    /// so the store invariant holds.
    pub fn set_record_clock(&self, key: &str, clock: u64) {
        if key.is_empty() {
            return;
        }
        let mut guard = self.state();
        let state = &mut *guard;
        state.materialize(key).clock = clock;
        state.clock = state.clock.max(clock);
    }

    /// The quality of `key`'s accepted value; zero when unset.
    pub fn get_quality(&self, key: &str) -> u32 {
        self.state().records.get(key).map(|r| r.quality).unwrap_or(0)
    }

    /// Raises the quality of `key`'s value; lowers it only when `force` is
    /// set. Returns the resulting quality.
    pub fn set_quality(&self, key: &str, quality: u32, force: bool) -> u32 {
        if key.is_empty() {
            return 0;
        }
        let mut state = self.state();
        let record = state.materialize(key);
        if force || quality > record.quality {
            record.quality = quality;
        }
        record.quality
    }

    /// The quality this process writes `key` with; zero when unset.
    pub fn get_write_quality(&self, key: &str) -> u32 {
        self.state()
            .records
            .get(key)
            .map(|r| r.write_quality)
            .unwrap_or(0)
    }

    /// Sets the quality this process writes `key` with.
    pub fn set_write_quality(&self, key: &str, quality: u32) {
        if key.is_empty() {
            return;
        }
        let mut state = self.state();
        state.materialize(key).write_quality = quality;
    }

    /// Snapshot of the records changed since the last dissemination pass.
    pub fn modified(&self) -> BTreeMap<String, Record> {
        let state = self.state();
        state
            .send_modified
            .iter()
            .filter_map(|key| {
                state
                    .records
                    .get(key)
                    .map(|record| (key.clone(), record.clone()))
            })
            .collect()
    }

    /// Clears the dissemination set and settles the affected records to
    /// [`Status::Unmodified`]. Call after handing
    /// [`KnowledgeStore::modified`] to a transport.
    pub fn reset_modified(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        for key in std::mem::take(&mut state.send_modified) {
            if let Some(record) = state.records.get_mut(&key) {
                record.status = Status::Unmodified;
            }
        }
    }

    /// Drops a single key from the dissemination set.
    pub fn reset_modified_key(&self, key: &str) {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.send_modified.remove(key) {
            if let Some(record) = state.records.get_mut(key) {
                record.status = Status::Unmodified;
            }
        }
    }

    /// Re-flags every global record as modified at the current clock, so
    /// the next dissemination pass resends the whole state. Useful for
    /// synchronizing late joiners.
    pub fn mark_all_modified(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        let clock = state.clock;
        let mut marked = 0usize;
        for (key, record) in state.records.iter_mut() {
            if record.scope == Scope::Global {
                record.status = Status::Modified;
                record.clock = clock;
                state.send_modified.insert(key.clone());
                state.ckpt_modified.insert(key.clone());
                marked += 1;
            }
        }
        debug!(marked, clock, "re-flagged global records for dissemination");
    }

    /// Blocks until the next change signal after entry.
    ///
    /// Atomically releases the store lock, sleeps on the change condition
    /// and reacquires the lock on wakeup. Wakeups are broadcast with no
    /// ordering among waiters; callers re-evaluating a predicate must loop.
    /// Timeout policies belong to the caller, layered over repeated calls.
    pub fn wait_for_change(&self) {
        let mut state = self.state.lock();
        let seen = state.version;
        while state.version == seen {
            self.changed.wait(&mut state);
        }
    }

    /// Wakes every waiter without a data change.
    pub fn signal(&self) {
        let mut state = self.state();
        self.notify(&mut state);
    }
}

impl fmt::Display for KnowledgeStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        for (key, record) in &state.records {
            writeln!(f, "{key}={record}")?;
        }
        Ok(())
    }
}
