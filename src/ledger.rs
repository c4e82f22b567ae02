use std::sync::Mutex;

use tracing::debug;

use crate::types::{CostBreakdown, CostRecord};

/// Process-wide, append-only record of model spend.
///
/// Shared by every concurrent request; all mutation is serialized behind
/// one lock so aggregate totals always equal the sum of the records.
/// A poisoned lock is recovered with `into_inner`: a panic elsewhere
/// cannot be allowed to drop cost records.
pub struct CostLedger {
    records: Mutex<Vec<CostRecord>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CostRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one invocation's cost. Records are never mutated or removed
    /// afterwards.
    pub fn record(&self, record: CostRecord) {
        debug!(
            step = %record.step,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_usd = record.cost_usd,
            "cost recorded"
        );
        self.lock().push(record);
    }

    /// Aggregates over the records stamped with one request id. Concurrent
    /// requests interleave their appends, so per-request views filter by
    /// id rather than by position.
    pub fn breakdown_for_request(&self, request_id: &str) -> CostBreakdown {
        let records = self.lock();
        CostBreakdown::from_records(records.iter().filter(|r| r.request_id == request_id))
    }

    /// Aggregates over the whole process lifetime (since last reset).
    pub fn breakdown(&self) -> CostBreakdown {
        let records = self.lock();
        CostBreakdown::from_records(records.iter())
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.lock().iter().map(|r| r.cost_usd).sum()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<CostRecord> {
        self.lock().clone()
    }

    /// Drop all records, starting a fresh accounting window.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

impl Default for CostLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(step: &str, model: &str, cost: f64) -> CostRecord {
        record_for("req-1", step, model, cost)
    }

    fn record_for(request_id: &str, step: &str, model: &str, cost: f64) -> CostRecord {
        CostRecord {
            request_id: request_id.into(),
            model: model.into(),
            step: step.into(),
            input_tokens: 100,
            output_tokens: 20,
            cost_usd: cost,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_total_is_sum_of_records() {
        let ledger = CostLedger::new();
        ledger.record(record("triage", "a", 0.001));
        ledger.record(record("summary", "b", 0.003));
        ledger.record(record("summary", "b", 0.002));
        assert_eq!(ledger.len(), 3);
        assert!((ledger.total_cost_usd() - 0.006).abs() < 1e-12);
        let breakdown = ledger.breakdown();
        assert!((breakdown.total_cost_usd - 0.006).abs() < 1e-12);
        assert!((breakdown.by_node["summary"] - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_breakdown_for_request_ignores_interleaved_records() {
        let ledger = CostLedger::new();
        ledger.record(record_for("req-a", "triage", "a", 0.001));
        ledger.record(record_for("req-b", "triage", "a", 0.010));
        ledger.record(record_for("req-a", "summary", "b", 0.004));
        ledger.record(record_for("req-b", "summary", "b", 0.040));

        let a = ledger.breakdown_for_request("req-a");
        assert!((a.total_cost_usd - 0.005).abs() < 1e-12);
        assert_eq!(a.total_input_tokens, 200);
        // The full view still sees everything.
        assert_eq!(ledger.len(), 4);
        assert!((ledger.total_cost_usd() - 0.055).abs() < 1e-12);
    }

    #[test]
    fn test_reset() {
        let ledger = CostLedger::new();
        ledger.record(record("triage", "a", 0.001));
        ledger.reset();
        assert!(ledger.is_empty());
        assert_eq!(ledger.total_cost_usd(), 0.0);
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        let ledger = std::sync::Arc::new(CostLedger::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    ledger.record(record("triage", "a", 0.001));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.len(), 800);
        assert!((ledger.total_cost_usd() - 0.8).abs() < 1e-9);
    }
}
