//! Undo/redo history.
//!
//! A linear stack of committed operations with a live cursor. Each entry
//! keeps the state its operation produced, so undo and redo are snapshot
//! swaps rather than recomputation. Recording after an undo discards the
//! redoable tail.

use crate::operation::Operation;
use crate::raster::RasterState;
use std::collections::VecDeque;
use std::time::SystemTime;

/// One committed operation and the state it produced.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub operation: Operation,
    pub snapshot: RasterState,
    pub timestamp: SystemTime,
    seq: u64,
}

/// What happened while recording an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Redoable entries discarded.
    pub truncated: usize,
    /// Oldest entries evicted to respect the depth bound.
    pub evicted: usize,
    /// An evicted entry was newer than the last saved state.
    pub evicted_unsaved: bool,
}

/// Bounded linear history.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    /// Number of entries currently applied.
    cursor: usize,
    /// State before the oldest retained entry.
    baseline: RasterState,
    baseline_seq: u64,
    next_seq: u64,
    saved_seq: u64,
    max_depth: usize,
}

impl History {
    /// Start a history over `initial` with at most `max_depth` undo steps.
    pub fn new(initial: RasterState, max_depth: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: 0,
            baseline: initial,
            baseline_seq: 0,
            next_seq: 1,
            saved_seq: 0,
            max_depth: max_depth.max(1),
        }
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// Entries currently applied.
    pub fn undo_depth(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Record a committed operation and its result.
    pub fn record(&mut self, operation: Operation, snapshot: RasterState) -> RecordOutcome {
        let mut outcome = RecordOutcome {
            truncated: self.entries.len() - self.cursor,
            ..Default::default()
        };
        self.entries.truncate(self.cursor);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(HistoryEntry {
            operation,
            snapshot,
            timestamp: SystemTime::now(),
            seq,
        });
        self.cursor += 1;

        while self.entries.len() > self.max_depth {
            let Some(oldest) = self.entries.pop_front() else {
                break;
            };
            if oldest.seq > self.saved_seq {
                outcome.evicted_unsaved = true;
            }
            self.baseline = oldest.snapshot;
            self.baseline_seq = oldest.seq;
            self.cursor -= 1;
            outcome.evicted += 1;
        }

        if outcome.truncated > 0 || outcome.evicted > 0 {
            log::debug!(
                "History: {} truncated, {} evicted, depth {}",
                outcome.truncated,
                outcome.evicted,
                self.entries.len()
            );
        }
        outcome
    }

    /// Step back one entry. Returns the state to reinstate, or `None` at the
    /// oldest retained state.
    pub fn undo(&mut self) -> Option<RasterState> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        Some(self.state_at_cursor().clone())
    }

    /// Step forward one entry. Returns the operation and its result, or
    /// `None` when nothing is redoable.
    pub fn redo(&mut self) -> Option<(Operation, RasterState)> {
        let entry = self.entries.get(self.cursor)?;
        let redone = (entry.operation.clone(), entry.snapshot.clone());
        self.cursor += 1;
        Some(redone)
    }

    /// Mark the current position as the state confirmed by the remote store.
    pub fn mark_saved(&mut self) {
        self.saved_seq = self.current_seq();
    }

    /// Whether the current position is the last saved one.
    pub fn is_at_saved(&self) -> bool {
        self.current_seq() == self.saved_seq
    }

    fn current_seq(&self) -> u64 {
        match self.cursor {
            0 => self.baseline_seq,
            n => self.entries[n - 1].seq,
        }
    }

    fn state_at_cursor(&self) -> &RasterState {
        match self.cursor {
            0 => &self.baseline,
            n => &self.entries[n - 1].snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::solid;

    fn base() -> RasterState {
        RasterState::from_base("mem://base.png", solid(100, 100, [0, 0, 0, 255])).unwrap()
    }

    fn resize(state: &RasterState, w: u32) -> (Operation, RasterState) {
        let op = Operation::Resize { width: w, height: w };
        let next = state.derive(solid(w, w, [0, 0, 0, 255]), Vec::new());
        (op, next)
    }

    fn commit_n(history: &mut History, n: u32) -> Vec<RasterState> {
        let mut states = vec![base()];
        for i in 1..=n {
            let (op, next) = resize(states.last().unwrap(), 10 + i);
            history.record(op, next.clone());
            states.push(next);
        }
        states
    }

    #[test]
    fn test_undo_then_redo_returns_to_same_state() {
        let mut history = History::new(base(), 50);
        let states = commit_n(&mut history, 5);

        for i in (0..5).rev() {
            assert_eq!(history.undo().unwrap(), states[i]);
        }
        assert!(!history.can_undo());
        assert!(history.undo().is_none());

        let mut last = None;
        for _ in 0..5 {
            last = history.redo().map(|(_, s)| s);
        }
        assert_eq!(last.unwrap(), states[5]);
        assert!(!history.can_redo());
        assert!(history.redo().is_none());
    }

    #[test]
    fn test_record_after_undo_discards_redo_branch() {
        let mut history = History::new(base(), 50);
        let states = commit_n(&mut history, 3);
        history.undo();
        history.undo();
        assert!(history.can_redo());

        let (op, next) = resize(&states[1], 99);
        let outcome = history.record(op, next);
        assert_eq!(outcome.truncated, 2);
        assert!(!history.can_redo());
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_depth_bound_evicts_oldest() {
        let mut history = History::new(base(), 3);
        let states = commit_n(&mut history, 5);
        assert_eq!(history.len(), 3);

        for _ in 0..3 {
            history.undo().unwrap();
        }
        assert!(!history.can_undo());
        assert_eq!(history.state_at_cursor(), &states[2]);
    }

    #[test]
    fn test_eviction_reports_unsaved_entries() {
        let mut history = History::new(base(), 2);
        let states = commit_n(&mut history, 2);
        history.mark_saved();
        assert!(history.is_at_saved());

        let (op, next) = resize(&states[2], 50);
        let outcome = history.record(op, next);
        assert_eq!(outcome.evicted, 1);
        assert!(!outcome.evicted_unsaved);
        assert!(!history.is_at_saved());

        let mut fresh = History::new(base(), 1);
        commit_n(&mut fresh, 1);
        let (op, next) = resize(&states[1], 60);
        assert!(fresh.record(op, next).evicted_unsaved);
    }
}
