//! Per-cycle accounting of finished items.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::ResultCode;
use crate::item::ItemId;

/// Outcomes of the current cycle in completion order
///
/// The three sequences are only ever extended together, so they stay
/// index-aligned.
#[derive(Debug, Default)]
pub struct BatchLedger {
    item_ids: Vec<ItemId>,
    last_clocks: Vec<i64>,
    result_codes: Vec<ResultCode>,
}

impl BatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item_id: ItemId, clock: i64, code: ResultCode) {
        self.item_ids.push(item_id);
        self.last_clocks.push(clock);
        self.result_codes.push(code);
    }

    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Drain everything recorded so far
    pub fn take(&mut self) -> RequeueBatch {
        RequeueBatch {
            item_ids: std::mem::take(&mut self.item_ids),
            last_clocks: std::mem::take(&mut self.last_clocks),
            result_codes: std::mem::take(&mut self.result_codes),
        }
    }

    /// Put back a batch the scheduler did not accept, ahead of newer entries
    pub fn restore(&mut self, mut batch: RequeueBatch) {
        batch.item_ids.append(&mut self.item_ids);
        batch.last_clocks.append(&mut self.last_clocks);
        batch.result_codes.append(&mut self.result_codes);

        self.item_ids = batch.item_ids;
        self.last_clocks = batch.last_clocks;
        self.result_codes = batch.result_codes;
    }
}

/// Requeue instruction handed to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequeueBatch {
    pub item_ids: Vec<ItemId>,
    pub last_clocks: Vec<i64>,
    pub result_codes: Vec<ResultCode>,
}

impl RequeueBatch {
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

/// Counters reset on every status report
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleCounters {
    pub queued: u64,
    pub processed: u64,
    /// Time spent inside cycles since the last report
    pub busy: Duration,
}

impl CycleCounters {
    pub fn report(&mut self) -> StatusReport {
        let report = StatusReport { processed: self.processed, queued: self.queued, busy: self.busy };
        *self = Self::default();
        report
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatusReport {
    pub processed: u64,
    pub queued: u64,
    pub busy: Duration,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "got {} values, queued {} in {:.6} sec",
            self.processed,
            self.queued,
            self.busy.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_drains_aligned_sequences() {
        let mut ledger = BatchLedger::new();
        ledger.push(1, 100, ResultCode::Success);
        ledger.push(2, 101, ResultCode::TimeoutError);

        let batch = ledger.take();
        assert_eq!(batch.item_ids, vec![1, 2]);
        assert_eq!(batch.last_clocks, vec![100, 101]);
        assert_eq!(batch.result_codes, vec![ResultCode::Success, ResultCode::TimeoutError]);
        assert!(ledger.is_empty());
        assert!(ledger.take().is_empty());
    }

    #[test]
    fn restore_keeps_older_entries_first() {
        let mut ledger = BatchLedger::new();
        ledger.push(1, 100, ResultCode::Success);
        let batch = ledger.take();

        ledger.push(2, 105, ResultCode::NetworkError);
        ledger.restore(batch);

        let batch = ledger.take();
        assert_eq!(batch.item_ids, vec![1, 2]);
        assert_eq!(batch.last_clocks, vec![100, 105]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn report_resets_counters() {
        let mut counters = CycleCounters { queued: 4, processed: 3, busy: Duration::from_millis(1500) };
        let report = counters.report();

        assert_eq!(report.to_string(), "got 3 values, queued 4 in 1.500000 sec");
        assert_eq!(counters.queued, 0);
        assert_eq!(counters.processed, 0);
    }
}
