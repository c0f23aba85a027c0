use chrono::{DateTime, Utc};

use crate::{TransactionCheckpoint, TransactionState};

/// Filter for scanning stored transactions, e.g. for recovery after a restart.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    /// Filter by workflow id.
    pub workflow_id: Option<String>,

    /// Filter by transaction state (any of these states).
    pub states: Option<Vec<TransactionState>>,

    /// Only transactions that have not reached a terminal state.
    pub unfinished_only: bool,

    /// Only transactions whose timeout deadline is at or before this instant.
    pub timeout_before: Option<DateTime<Utc>>,

    /// Maximum number of transactions to return.
    pub limit: Option<usize>,

    /// Number of transactions to skip.
    pub offset: Option<usize>,
}

impl TransactionQuery {
    /// Creates a new empty query matching every transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for the transactions of one workflow.
    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            ..Default::default()
        }
    }

    /// Creates a query for unfinished transactions whose deadline has passed.
    pub fn expired(now: DateTime<Utc>) -> Self {
        Self {
            unfinished_only: true,
            timeout_before: Some(now),
            ..Default::default()
        }
    }

    /// Filters by workflow id.
    pub fn workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Filters by a set of states.
    pub fn states(mut self, states: Vec<TransactionState>) -> Self {
        self.states = Some(states);
        self
    }

    /// Restricts the scan to unfinished transactions.
    pub fn unfinished(mut self) -> Self {
        self.unfinished_only = true;
        self
    }

    /// Limits the number of transactions returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many transactions before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the checkpoint passes every filter except paging.
    pub fn matches(&self, checkpoint: &TransactionCheckpoint) -> bool {
        let flow = &checkpoint.flow;
        if let Some(ref workflow_id) = self.workflow_id
            && &flow.workflow_id != workflow_id
        {
            return false;
        }
        if let Some(ref states) = self.states
            && !states.contains(&flow.state)
        {
            return false;
        }
        if self.unfinished_only && flow.has_finished() {
            return false;
        }
        if let Some(before) = self.timeout_before {
            match flow.timeout_at {
                Some(deadline) if deadline <= before => {}
                _ => return false,
            }
        }
        true
    }
}
