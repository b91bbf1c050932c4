use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use matq_core::{Dims, Matrix, MatqError, Operation};

use crate::cancel::{cancel_pair, CancelFlag, Canceller};

/// Lifecycle of a run as seen by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Dispatching,
    Collecting,
    Complete,
    /// Budget exhausted; partial results kept, collect may be retried.
    TimedOut,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

/// Full state of a run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub operation: Operation,
    pub a: Dims,
    pub b: Dims,
    pub state: RunState,
    /// Number of chunks (T). 0 until partitioned.
    pub expected: usize,
    pub collected: usize,
    /// Indices outstanding when the run stopped early.
    pub missing: Vec<usize>,
    pub result: Option<Matrix>,
    pub error: Option<String>,
    /// Unix ms when the run was registered.
    pub submitted_at: u64,
    /// Unix ms of the last state change.
    pub updated_at: u64,
}

/// In-memory store for runs.
#[derive(Clone, Default)]
pub struct RunStore {
    /// run_id → RunRecord
    runs: Arc<DashMap<String, RunRecord>>,
    /// run_id → cancel signal
    cancels: Arc<DashMap<String, Canceller>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run as Pending. Duplicate ids are silently ignored.
    pub fn register(&self, id: &str, operation: Operation, a: Dims, b: Dims) {
        self.runs.entry(id.to_string()).or_insert_with(|| {
            let now = now_ms();
            RunRecord {
                id: id.to_string(),
                operation,
                a,
                b,
                state: RunState::Pending,
                expected: 0,
                collected: 0,
                missing: Vec::new(),
                result: None,
                error: None,
                submitted_at: now,
                updated_at: now,
            }
        });
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut RunRecord)) {
        if let Some(mut run) = self.runs.get_mut(id) {
            f(&mut run);
            run.updated_at = now_ms();
        }
    }

    pub fn set_state(&self, id: &str, state: RunState) {
        self.update(id, |r| r.state = state);
    }

    pub fn set_expected(&self, id: &str, expected: usize) {
        self.update(id, |r| r.expected = expected);
    }

    pub fn record_progress(&self, id: &str, collected: usize) {
        self.update(id, |r| r.collected = collected);
    }

    pub fn complete(&self, id: &str, result: Matrix) {
        self.update(id, |r| {
            r.state = RunState::Complete;
            r.collected = r.expected;
            r.missing.clear();
            r.error = None;
            r.result = Some(result);
        });
        self.cancels.remove(id);
    }

    /// Record why a run stopped. TimedOut and Cancelled keep their missing set.
    pub fn fail(&self, id: &str, error: &MatqError) {
        let state = match error {
            MatqError::TimedOut { .. } => RunState::TimedOut,
            MatqError::Cancelled { .. } => RunState::Cancelled,
            _ => RunState::Failed,
        };
        self.update(id, |r| {
            r.state = state;
            if let Some(missing) = error.missing() {
                r.collected = r.expected.saturating_sub(missing.len());
                r.missing = missing.to_vec();
            }
            r.error = Some(error.to_string());
        });
        if state.is_terminal() {
            self.cancels.remove(id);
        }
    }

    /// Cancel signal for a run, created on first use.
    pub fn cancel_flag(&self, id: &str) -> CancelFlag {
        self.cancels
            .entry(id.to_string())
            .or_insert_with(|| cancel_pair().0)
            .flag()
    }

    /// Request cancellation. A Pending or TimedOut run is cancelled on the
    /// spot; an active one stops at its next check. Returns false for
    /// unknown or already finished runs.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(state) = self.runs.get(id).map(|r| r.state) else {
            return false;
        };
        if state.is_terminal() {
            return false;
        }
        self.cancels
            .entry(id.to_string())
            .or_insert_with(|| cancel_pair().0)
            .cancel();
        match state {
            RunState::Pending => self.update(id, |r| r.state = RunState::Cancelled),
            RunState::TimedOut => {
                self.update(id, |r| {
                    r.state = RunState::Cancelled;
                    r.error = Some(format!(
                        "cancelled after timing out with {} of {} chunks missing",
                        r.missing.len(),
                        r.expected
                    ));
                });
                self.cancels.remove(id);
            }
            _ => {}
        }
        true
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.runs
            .get(id)
            .is_some_and(|r| r.state == RunState::Cancelled)
    }

    pub fn get(&self, id: &str) -> Option<RunRecord> {
        self.runs.get(id).map(|r| r.clone())
    }

    /// All runs, oldest first.
    pub fn all(&self) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    pub fn count_in(&self, state: RunState) -> usize {
        self.runs.iter().filter(|r| r.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(id: &str) -> RunStore {
        let store = RunStore::new();
        store.register(id, Operation::Addition, Dims::new(2, 2), Dims::new(2, 2));
        store
    }

    #[test]
    fn register_is_idempotent() {
        let store = store_with("r1");
        store.set_state("r1", RunState::Collecting);
        store.register("r1", Operation::Multiplication, Dims::new(1, 1), Dims::new(1, 1));

        let run = store.get("r1").unwrap();
        assert_eq!(run.state, RunState::Collecting);
        assert_eq!(run.operation, Operation::Addition);
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn complete_stores_result() {
        let store = store_with("r1");
        store.set_expected("r1", 2);
        store.complete("r1", Matrix::identity(2));

        let run = store.get("r1").unwrap();
        assert_eq!(run.state, RunState::Complete);
        assert_eq!(run.collected, 2);
        assert_eq!(run.result, Some(Matrix::identity(2)));
    }

    #[test]
    fn timeout_keeps_missing_and_is_not_terminal() {
        let store = store_with("r1");
        store.set_expected("r1", 4);
        store.fail("r1", &MatqError::TimedOut { expected: 4, missing: vec![1, 3] });

        let run = store.get("r1").unwrap();
        assert_eq!(run.state, RunState::TimedOut);
        assert_eq!(run.missing, vec![1, 3]);
        assert_eq!(run.collected, 2);
        assert!(!run.state.is_terminal());
    }

    #[test]
    fn cancel_pending_run_marks_it_cancelled() {
        let store = store_with("r1");
        assert!(store.cancel("r1"));
        assert!(store.is_cancelled("r1"));
        assert!(store.cancel_flag("r1").is_cancelled());
        assert!(!store.cancel("r1"));
        assert!(!store.cancel("unknown"));
    }

    #[test]
    fn cancel_active_run_raises_existing_flag() {
        let store = store_with("r1");
        let flag = store.cancel_flag("r1");
        store.set_state("r1", RunState::Collecting);
        assert!(store.cancel("r1"));
        assert!(flag.is_cancelled());
        assert_eq!(store.get("r1").unwrap().state, RunState::Collecting);
    }

    #[test]
    fn cancel_timed_out_run_finishes_it() {
        let store = store_with("r1");
        let flag = store.cancel_flag("r1");
        store.set_expected("r1", 2);
        store.fail("r1", &MatqError::TimedOut { expected: 2, missing: vec![1] });

        assert!(store.cancel("r1"));
        let run = store.get("r1").unwrap();
        assert_eq!(run.state, RunState::Cancelled);
        assert_eq!(run.missing, vec![1]);
        assert!(run.error.unwrap().contains("1 of 2 chunks missing"));
        assert!(flag.is_cancelled());
        assert!(!store.cancel("r1"));
    }

    #[test]
    fn count_by_state() {
        let store = store_with("a");
        store.register("b", Operation::Addition, Dims::new(1, 1), Dims::new(1, 1));
        store.fail("b", &MatqError::EmptyMatrix(Dims::new(0, 0)));
        assert_eq!(store.count_in(RunState::Pending), 1);
        assert_eq!(store.count_in(RunState::Failed), 1);
    }
}
