//! Session slots and the table that owns them.
//!
//! Each slot holds the session's ordered queue, its admission budget and
//! the cancellation tokens of admitted runs. The table maps session ids to
//! slots. Structural changes (insert, remove) go through the table's shard
//! locks; queue and budget changes go through the slot's own mutex. The
//! lock order is always shard, then slot.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    courier_common::Envelope,
    dashmap::DashMap,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{Error, Result};

struct Queued {
    envelope: Envelope,
    priority: bool,
}

struct SlotState {
    queue: VecDeque<Queued>,
    /// Leading queue entries that are priority-marked.
    priority_len: usize,
    /// Remaining admissions; `ceiling - available` runs are outstanding.
    available: usize,
    outstanding: HashMap<u64, CancellationToken>,
}

impl SlotState {
    fn push(&mut self, envelope: Envelope, priority: bool) {
        if priority {
            self.queue.insert(self.priority_len, Queued { envelope, priority });
            self.priority_len += 1;
        } else {
            self.queue.push_back(Queued { envelope, priority });
        }
    }

    fn push_front(&mut self, queued: Queued) {
        if queued.priority {
            self.priority_len += 1;
        }
        self.queue.push_front(queued);
    }

    fn pop(&mut self) -> Option<Queued> {
        let queued = self.queue.pop_front()?;
        if queued.priority {
            self.priority_len = self.priority_len.saturating_sub(1);
        }
        Some(queued)
    }
}

struct SessionSlot {
    ceiling: usize,
    state: Mutex<SlotState>,
}

impl SessionSlot {
    fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            state: Mutex::new(SlotState {
                queue: VecDeque::new(),
                priority_len: 0,
                available: ceiling,
                outstanding: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && state.outstanding.is_empty()
    }
}

/// Cancellation handle for one admitted run.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub id: u64,
    pub cancel: CancellationToken,
}

/// An envelope moved from a slot's queue into processing.
#[derive(Debug)]
pub struct Admission {
    pub session_id: String,
    pub envelope: Envelope,
    pub handle: ExecutionHandle,
    priority: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Queued envelopes removed; these are never admitted.
    pub discarded: usize,
    /// Admitted runs whose token was cancelled.
    pub signalled: usize,
}

impl std::ops::AddAssign for CancelReport {
    fn add_assign(&mut self, other: Self) {
        self.discarded += other.discarded;
        self.signalled += other.signalled;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub sessions: usize,
    pub queued: usize,
    pub outstanding: usize,
}

/// Concurrency-safe map from session id to slot.
pub struct SessionTable {
    ceiling: usize,
    slots: DashMap<String, Arc<SessionSlot>>,
    next_handle: AtomicU64,
}

impl SessionTable {
    /// `ceiling` is the per-session concurrency limit; zero is treated as one.
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            slots: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.get(session_id).map(|slot| Arc::clone(slot.value()))
    }

    /// Queue an envelope in its session's slot, creating the slot if needed.
    /// Priority envelopes go ahead of every normal one, in arrival order
    /// among themselves. Returns the queue depth after insertion.
    pub fn submit(&self, envelope: Envelope, priority: bool) -> Result<usize> {
        let session_id = match envelope.session_id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(Error::MissingSessionId {
                    envelope_id: envelope.id().to_string(),
                });
            },
        };

        // Holding the entry guard while pushing keeps `remove_if_idle` from
        // deleting the slot between lookup and insert.
        let entry = self
            .slots
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionSlot::new(self.ceiling)));
        let mut state = entry.lock();
        state.push(envelope, priority);
        Ok(state.queue.len())
    }

    /// Pop the head of the session's queue if it has spare capacity.
    /// Performs no mutation when nothing is admitted.
    pub fn try_admit(&self, session_id: &str) -> Result<Option<Admission>> {
        let Some(slot) = self.slot(session_id) else {
            return Ok(None);
        };
        let mut state = slot.lock();
        if state.available > slot.ceiling
            || slot.ceiling - state.available != state.outstanding.len()
        {
            return Err(Error::invariant(
                session_id,
                format!(
                    "admission budget {} of {} disagrees with {} outstanding runs",
                    state.available,
                    slot.ceiling,
                    state.outstanding.len()
                ),
            ));
        }
        if state.available == 0 {
            return Ok(None);
        }
        let Some(Queued { envelope, priority }) = state.pop() else {
            return Ok(None);
        };

        state.available -= 1;
        let handle = ExecutionHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        };
        state.outstanding.insert(handle.id, handle.cancel.clone());
        debug!(
            session_id,
            envelope_id = %envelope.id(),
            handle = handle.id,
            available = state.available,
            "envelope admitted"
        );
        Ok(Some(Admission {
            session_id: session_id.to_string(),
            envelope,
            handle,
            priority,
        }))
    }

    /// Return an admission's capacity to its slot. Releasing for a session
    /// that no longer exists, or a handle already released, is a no-op.
    pub fn release(&self, session_id: &str, handle_id: u64) -> Result<()> {
        let Some(slot) = self.slot(session_id) else {
            debug!(session_id, handle = handle_id, "release for removed session");
            return Ok(());
        };
        let mut state = slot.lock();
        if state.outstanding.remove(&handle_id).is_none() {
            warn!(session_id, handle = handle_id, "release for unknown handle");
            return Ok(());
        }
        state.available += 1;
        if state.available > slot.ceiling {
            return Err(Error::invariant(
                session_id,
                format!(
                    "released past ceiling ({} > {})",
                    state.available, slot.ceiling
                ),
            ));
        }
        Ok(())
    }

    /// Undo an admission that could not be handed to the worker pool: the
    /// envelope goes back to the head of its queue and the capacity returns.
    pub fn rollback(&self, admission: Admission) -> Result<()> {
        let Admission {
            session_id,
            envelope,
            handle,
            priority,
        } = admission;

        let entry = self
            .slots
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionSlot::new(self.ceiling)));
        let mut state = entry.lock();
        let cancelled = handle.cancel.is_cancelled();
        if state.outstanding.remove(&handle.id).is_some() {
            state.available += 1;
        }
        if state.available > entry.ceiling {
            return Err(Error::invariant(&session_id, "rollback past ceiling"));
        }
        // A cancel that landed while the admission was in flight discards
        // the envelope instead of re-queueing it.
        if !cancelled {
            state.push_front(Queued { envelope, priority });
        }
        Ok(())
    }

    /// Discard the session's queue and cancel its admitted runs.
    pub fn cancel(&self, session_id: &str) -> CancelReport {
        let Some(slot) = self.slot(session_id) else {
            return CancelReport::default();
        };
        let mut state = slot.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        state.priority_len = 0;
        for token in state.outstanding.values() {
            token.cancel();
        }
        CancelReport {
            discarded,
            signalled: state.outstanding.len(),
        }
    }

    pub fn cancel_all(&self) -> CancelReport {
        let mut total = CancelReport::default();
        for session_id in self.session_ids() {
            total += self.cancel(&session_id);
        }
        total
    }

    /// Remove the slot if its queue is empty and nothing is outstanding.
    pub fn remove_if_idle(&self, session_id: &str) -> bool {
        self.slots
            .remove_if(session_id, |_, slot| slot.is_idle())
            .is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    #[cfg(test)]
    fn contains(&self, session_id: &str) -> bool {
        self.slots.contains_key(session_id)
    }

    pub fn queued(&self, session_id: &str) -> usize {
        self.slot(session_id)
            .map_or(0, |slot| slot.lock().queue.len())
    }

    pub fn stats(&self) -> TableStats {
        let mut stats = TableStats::default();
        for entry in self.slots.iter() {
            let state = entry.value().lock();
            stats.sessions += 1;
            stats.queued += state.queue.len();
            stats.outstanding += state.outstanding.len();
        }
        stats
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, courier_common::types::attr, rstest::rstest};

    fn envelope(session: &str, text: &str) -> Envelope {
        Envelope::text(text).with_attribute(attr::SESSION_ID, session)
    }

    fn admit_text(table: &SessionTable, session: &str) -> Option<(String, u64)> {
        table.try_admit(session).unwrap().map(|admission| {
            (
                admission.envelope.text_payload().unwrap().to_string(),
                admission.handle.id,
            )
        })
    }

    #[test]
    fn priority_envelope_jumps_queue() {
        let table = SessionTable::new(1);
        table.submit(envelope("u1", "A"), false).unwrap();
        table.submit(envelope("u1", "B"), false).unwrap();
        table.submit(envelope("u1", "C"), true).unwrap();

        let mut order = Vec::new();
        while let Some((text, handle)) = admit_text(&table, "u1") {
            order.push(text);
            table.release("u1", handle).unwrap();
        }
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn priority_envelopes_keep_arrival_order() {
        let table = SessionTable::new(1);
        table.submit(envelope("u1", "a"), false).unwrap();
        table.submit(envelope("u1", "#1"), true).unwrap();
        table.submit(envelope("u1", "b"), false).unwrap();
        table.submit(envelope("u1", "#2"), true).unwrap();

        let mut order = Vec::new();
        while let Some((text, handle)) = admit_text(&table, "u1") {
            order.push(text);
            table.release("u1", handle).unwrap();
        }
        assert_eq!(order, vec!["#1", "#2", "a", "b"]);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    fn admission_bounded_by_ceiling(#[case] ceiling: usize) {
        let table = SessionTable::new(ceiling);
        for i in 0..ceiling + 3 {
            table.submit(envelope("s", &i.to_string()), false).unwrap();
        }
        let mut handles = Vec::new();
        while let Some((_, handle)) = admit_text(&table, "s") {
            handles.push(handle);
        }
        assert_eq!(handles.len(), ceiling);
        assert_eq!(table.queued("s"), 3);

        // Failed admission leaves everything untouched.
        assert!(table.try_admit("s").unwrap().is_none());
        assert_eq!(table.queued("s"), 3);

        table.release("s", handles[0]).unwrap();
        assert!(table.try_admit("s").unwrap().is_some());
    }

    #[test]
    fn sessions_are_isolated() {
        let table = SessionTable::new(1);
        table.submit(envelope("x", "x1"), false).unwrap();
        table.submit(envelope("x", "x2"), false).unwrap();
        table.submit(envelope("y", "y1"), false).unwrap();
        assert!(admit_text(&table, "x").is_some());
        assert!(admit_text(&table, "x").is_none());
        assert_eq!(admit_text(&table, "y").unwrap().0, "y1");
    }

    #[test]
    fn missing_session_id_rejected() {
        let table = SessionTable::new(1);
        let err = table.submit(Envelope::text("orphan"), false).unwrap_err();
        assert!(matches!(err, Error::MissingSessionId { .. }));
        let err = table
            .submit(envelope("", "blank"), false)
            .unwrap_err();
        assert!(matches!(err, Error::MissingSessionId { .. }));
    }

    #[test]
    fn cancel_drains_queue_and_signals_outstanding() {
        let table = SessionTable::new(1);
        for text in ["a", "b", "c", "d"] {
            table.submit(envelope("u1", text), false).unwrap();
        }
        let admission = table.try_admit("u1").unwrap().unwrap();

        let report = table.cancel("u1");
        assert_eq!(report, CancelReport {
            discarded: 3,
            signalled: 1
        });
        assert_eq!(table.queued("u1"), 0);
        assert!(admission.handle.cancel.is_cancelled());

        // Still outstanding until released.
        assert!(!table.remove_if_idle("u1"));
        table.release("u1", admission.handle.id).unwrap();
        assert!(table.remove_if_idle("u1"));
        assert!(!table.contains("u1"));
    }

    #[test]
    fn release_races_are_no_ops() {
        let table = SessionTable::new(2);
        table.release("gone", 7).unwrap();

        table.submit(envelope("u1", "a"), false).unwrap();
        let admission = table.try_admit("u1").unwrap().unwrap();
        table.release("u1", admission.handle.id).unwrap();
        // Double release does not inflate the budget.
        table.release("u1", admission.handle.id).unwrap();

        for text in ["b", "c", "d"] {
            table.submit(envelope("u1", text), false).unwrap();
        }
        assert!(table.try_admit("u1").unwrap().is_some());
        assert!(table.try_admit("u1").unwrap().is_some());
        assert!(table.try_admit("u1").unwrap().is_none());
    }

    #[test]
    fn rollback_restores_head_and_capacity() {
        let table = SessionTable::new(1);
        table.submit(envelope("u1", "first"), false).unwrap();
        table.submit(envelope("u1", "second"), false).unwrap();
        let admission = table.try_admit("u1").unwrap().unwrap();
        table.rollback(admission).unwrap();

        assert_eq!(table.stats(), TableStats {
            sessions: 1,
            queued: 2,
            outstanding: 0
        });
        assert_eq!(admit_text(&table, "u1").unwrap().0, "first");
    }

    #[test]
    fn rollback_after_cancel_discards() {
        let table = SessionTable::new(1);
        table.submit(envelope("u1", "stale"), false).unwrap();
        let admission = table.try_admit("u1").unwrap().unwrap();
        table.cancel("u1");
        table.rollback(admission).unwrap();
        assert_eq!(table.queued("u1"), 0);
        assert!(table.remove_if_idle("u1"));
    }

    #[test]
    fn submit_after_removal_recreates_slot() {
        let table = SessionTable::new(1);
        table.submit(envelope("u1", "a"), false).unwrap();
        let admission = table.try_admit("u1").unwrap().unwrap();
        table.release("u1", admission.handle.id).unwrap();
        assert!(table.remove_if_idle("u1"));

        table.submit(envelope("u1", "b"), false).unwrap();
        assert_eq!(admit_text(&table, "u1").unwrap().0, "b");
    }

    #[test]
    fn concurrent_submit_and_prune_never_lose_envelopes() {
        let table = Arc::new(SessionTable::new(1));
        let pruner = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    table.remove_if_idle("u1");
                }
            })
        };
        for i in 0..1_000 {
            table.submit(envelope("u1", &i.to_string()), false).unwrap();
            let admission = table.try_admit("u1").unwrap().unwrap();
            table.release("u1", admission.handle.id).unwrap();
        }
        pruner.join().unwrap();
    }
}
