//! Debugger support: bounded snapshot and trace rings plus per-step change
//! tracking.
//!
//! Before each step the board pushes a [`Snapshot`] of (pc, register file,
//! retired counter); after the step it reports the post-step register file
//! and the byte addresses the fabric saw written. Reverse-step pops the most
//! recent snapshot back into the machine. Memory writes are *not* undone —
//! the history is meant for short-range "stepped past it" recovery, and
//! keeping per-step byte diffs would cost more than the feature is worth.
//! The written-address list at least tells the host which bytes a step
//! touched.

use std::collections::VecDeque;

/// Default maximum number of reverse-step snapshots.
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 512;
/// Default maximum number of retained trace records.
pub const DEFAULT_TRACE_LIMIT: usize = 10_000;

/// State restored by a reverse step.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Snapshot {
    pub pc: u32,
    pub x: [u32; 32],
    pub retired: u64,
    /// The load-reserved flag travels with the snapshot so that stepping
    /// back across a reservation does not leave a stale one armed.
    pub reservation: Option<u32>,
}

/// One retired instruction, ready for display.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TraceRecord {
    /// Retired-counter value when the instruction executed.
    pub cycle: u64,
    /// Program counter the instruction was fetched from.
    pub pc: u32,
    /// The fetched encoding (16-bit value for compressed instructions).
    pub raw: u32,
    /// Rendered mnemonic.
    pub text: String,
}

#[derive(Debug)]
pub struct History {
    snapshots: VecDeque<Snapshot>,
    trace: VecDeque<TraceRecord>,
    snapshot_limit: usize,
    trace_limit: usize,
    reg_changed: [bool; 32],
    written: Vec<u32>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_LIMIT, DEFAULT_TRACE_LIMIT)
    }
}

impl History {
    pub fn new(snapshot_limit: usize, trace_limit: usize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(snapshot_limit.min(DEFAULT_SNAPSHOT_LIMIT)),
            trace: VecDeque::new(),
            snapshot_limit,
            trace_limit,
            reg_changed: [false; 32],
            written: Vec::new(),
        }
    }

    /// Record the pre-step state. Drops the oldest snapshot at capacity.
    pub fn push_snapshot(&mut self, snapshot: Snapshot) {
        if self.snapshots.len() == self.snapshot_limit {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    /// Record the outcome of the step that followed the last
    /// [`push_snapshot`](Self::push_snapshot): which registers changed,
    /// which bytes were written, and the trace entry to display.
    pub fn finish_step(&mut self, post_x: &[u32; 32], written: Vec<u32>, record: TraceRecord) {
        if let Some(snapshot) = self.snapshots.back() {
            for i in 0..32 {
                self.reg_changed[i] = snapshot.x[i] != post_x[i];
            }
        }
        self.written = written;
        if self.trace.len() == self.trace_limit {
            self.trace.pop_front();
        }
        self.trace.push_back(record);
    }

    /// Pop the most recent snapshot for a reverse step, dropping the
    /// matching trace record and the per-step change lists. Returns `None`
    /// when there is nothing to step back to.
    pub fn pop_snapshot(&mut self) -> Option<Snapshot> {
        let snapshot = self.snapshots.pop_back()?;
        self.trace.pop_back();
        self.reg_changed = [false; 32];
        self.written.clear();
        Some(snapshot)
    }

    /// Per-register changed flags from the most recent step, for UI
    /// highlighting.
    pub fn reg_changed(&self) -> &[bool; 32] {
        &self.reg_changed
    }

    /// Byte addresses written by the most recent step, device regions
    /// included. The caller consumes the list once per UI frame.
    pub fn take_written(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.written)
    }

    pub fn trace(&self) -> impl ExactSizeIterator<Item = &TraceRecord> {
        self.trace.iter()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Forget everything, as on program load.
    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.trace.clear();
        self.reg_changed = [false; 32];
        self.written.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(n: u64) -> Snapshot {
        Snapshot {
            pc: n as u32 * 4,
            x: [0; 32],
            retired: n,
            reservation: None,
        }
    }

    fn record(n: u64) -> TraceRecord {
        TraceRecord {
            cycle: n,
            pc: n as u32 * 4,
            raw: 0x13,
            text: "addi x0, x0, 0".into(),
        }
    }

    #[test]
    fn test_snapshot_ring_drops_oldest() {
        let mut history = History::new(2, 10);
        history.push_snapshot(snapshot(0));
        history.push_snapshot(snapshot(1));
        history.push_snapshot(snapshot(2));
        assert_eq!(2, history.snapshot_count());
        assert_eq!(Some(snapshot(2)), history.pop_snapshot());
        assert_eq!(Some(snapshot(1)), history.pop_snapshot());
        assert_eq!(None, history.pop_snapshot());
    }

    #[test]
    fn test_trace_ring_drops_oldest() {
        let mut history = History::new(8, 2);
        for n in 0..3 {
            history.push_snapshot(snapshot(n));
            history.finish_step(&[0; 32], Vec::new(), record(n));
        }
        let cycles: Vec<u64> = history.trace().map(|r| r.cycle).collect();
        assert_eq!(vec![1, 2], cycles);
    }

    #[test]
    fn test_reg_change_flags() {
        let mut history = History::default();
        history.push_snapshot(snapshot(0));
        let mut post = [0u32; 32];
        post[5] = 7;
        history.finish_step(&post, Vec::new(), record(0));
        let changed = history.reg_changed();
        assert!(changed[5]);
        assert!(!changed[4]);
    }

    #[test]
    fn test_pop_truncates_trace_and_changes() {
        let mut history = History::default();
        history.push_snapshot(snapshot(0));
        let mut post = [0u32; 32];
        post[1] = 1;
        history.finish_step(&post, vec![0x100], record(0));
        assert!(history.pop_snapshot().is_some());
        assert_eq!(0, history.trace().len());
        assert!(!history.reg_changed()[1]);
        assert!(history.take_written().is_empty());
    }

    #[test]
    fn test_take_written_consumes() {
        let mut history = History::default();
        history.push_snapshot(snapshot(0));
        history.finish_step(&[0; 32], vec![1, 2, 3], record(0));
        assert_eq!(vec![1, 2, 3], history.take_written());
        assert!(history.take_written().is_empty());
    }
}
