//! In-memory plan for one prioritized sync pass.

use std::collections::HashSet;

use offsync_common::ActionId;
use offsync_storage::OfflineAction;

/// Pending actions ordered by priority tier, then enqueue time, then id.
///
/// An action becomes eligible once every dependency that was pending when the
/// pass started has completed within the pass. Dependencies on actions that
/// were not pending (already synced, failed, or unknown) do not block.
#[derive(Debug)]
pub struct PassQueue {
    waiting: Vec<OfflineAction>,
    pending_at_start: HashSet<ActionId>,
    completed: HashSet<ActionId>,
}

impl PassQueue {
    pub fn new(mut actions: Vec<OfflineAction>) -> Self {
        actions.sort_by_key(|a| (a.priority, a.timestamp, a.id));
        let pending_at_start = actions.iter().map(|a| a.id).collect();
        Self {
            waiting: actions,
            pending_at_start,
            completed: HashSet::new(),
        }
    }

    fn is_ready(&self, action: &OfflineAction) -> bool {
        action
            .dependencies
            .iter()
            .all(|dep| !self.pending_at_start.contains(dep) || self.completed.contains(dep))
    }

    /// Take up to `size` eligible actions in priority order.
    pub fn next_batch(&mut self, size: usize) -> Vec<OfflineAction> {
        let mut batch = Vec::new();
        let mut kept = Vec::with_capacity(self.waiting.len());

        for action in std::mem::take(&mut self.waiting) {
            if batch.len() < size && self.is_ready(&action) {
                batch.push(action);
            } else {
                kept.push(action);
            }
        }

        self.waiting = kept;
        batch
    }

    /// Record that `id` completed, unblocking its dependents.
    pub fn complete(&mut self, id: ActionId) {
        self.completed.insert(id);
    }

    /// Actions not yet handed out.
    pub fn remaining(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
