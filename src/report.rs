//! Per-task final reports and their optional persistence.
//!
//! Reports are stored in a sled tree under keys of the form `{timestamp:020}_{id}`, so a
//! lexicographic scan returns them in time order and [`ReportStore::since`] is a filtered scan.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, TaskError};
use crate::simulator::AgentId;
use crate::task::Phase;

const REPORTS_TREE: &str = "task_reports";

/// The final word on one task of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_index: usize,
    pub kind: String,
    pub description: String,
    /// `None` when the task never got an agent.
    pub agent: Option<AgentId>,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    /// The simulator's last error text for the agent, if any.
    pub last_sim_error: Option<String>,
    pub phases: Vec<Phase>,
    pub steps: u64,
    pub finished_round: u64,
    /// Unix seconds.
    pub timestamp: u64,
}

impl TaskReport {
    pub fn failed(&self) -> bool {
        !self.success
    }

    pub fn set_outcome(&mut self, outcome: &Result<(), TaskError>) {
        match outcome {
            Ok(()) => {
                self.success = true;
                self.failure = None;
                self.message = None;
            }
            Err(e) => {
                self.success = false;
                self.failure = Some(e.kind());
                self.message = Some(e.to_string());
            }
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Embedded, append-only report log.
pub struct ReportStore {
    db: sled::Db,
}

impl std::fmt::Debug for ReportStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportStore")
            .field("size_on_disk", &self.db.size_on_disk().ok())
            .finish()
    }
}

impl ReportStore {
    pub fn open(path: &Path) -> Result<Self, TaskError> {
        let db = sled::open(path)?;
        tracing::info!(path = %path.display(), "report store opened");
        Ok(Self { db })
    }

    /// Wraps an already-open database.
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    pub fn record(&self, report: &TaskReport) -> Result<(), TaskError> {
        let tree = self.db.open_tree(REPORTS_TREE)?;
        let id = self.db.generate_id()?;
        let key = format!("{:020}_{id}", report.timestamp);
        let value = serde_json::to_vec(report).map_err(|e| TaskError::Store(e.to_string()))?;
        tree.insert(key.as_bytes(), value)?;
        tree.flush()?;
        Ok(())
    }

    /// Every report recorded at or after `start_ts` (unix seconds), oldest first.
    pub fn since(&self, start_ts: u64) -> Result<Vec<TaskReport>, TaskError> {
        let tree = self.db.open_tree(REPORTS_TREE)?;
        let start = format!("{start_ts:020}");
        let mut out = Vec::new();
        for entry in tree.range(start.as_bytes()..) {
            let (_, value) = entry?;
            match serde_json::from_slice::<TaskReport>(&value) {
                Ok(report) => out.push(report),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable report"),
            }
        }
        Ok(out)
    }
}

impl Drop for ReportStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            tracing::warn!(error = %e, "report store flush failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ReportStore {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("failed to open temporary sled db");
        ReportStore::from_db(db)
    }

    fn report(index: usize, timestamp: u64, outcome: Result<(), TaskError>) -> TaskReport {
        let mut r = TaskReport {
            task_index: index,
            kind: "heat_object".into(),
            description: "Heat the Bread".into(),
            agent: Some(AgentId(0)),
            success: false,
            failure: None,
            message: None,
            last_sim_error: None,
            phases: vec![Phase::Locate],
            steps: 3,
            finished_round: 3,
            timestamp,
        };
        r.set_outcome(&outcome);
        r
    }

    #[test]
    fn since_filters_by_timestamp_in_order() {
        let store = store();
        store.record(&report(1, 20, Ok(()))).unwrap();
        store.record(&report(0, 10, Err(TaskError::Timeout))).unwrap();
        store.record(&report(2, 30, Ok(()))).unwrap();

        let all = store.since(0).unwrap();
        assert_eq!(all.iter().map(|r| r.task_index).collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(all[0].failure, Some(FailureKind::Timeout));

        let recent = store.since(20).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|r| r.timestamp >= 20));
    }

    #[test]
    fn outcome_maps_to_failure_kind_and_message() {
        let r = report(
            0,
            1,
            Err(TaskError::InteractionFailed {
                action: "OpenObject".into(),
                message: "Fridge|1 is not visible".into(),
            }),
        );
        assert!(r.failed());
        assert_eq!(r.failure, Some(FailureKind::InteractionFailed));
        assert!(r.message.unwrap().contains("OpenObject"));
    }
}
