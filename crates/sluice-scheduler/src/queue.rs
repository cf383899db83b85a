//! Queue of steps waiting for an agent.

use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use sluice_core::agent::AgentRequirement;
use sluice_core::ids::JobId;
use sluice_core::node::NodePath;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// A step that found no idle agent and waits for one.
#[derive(Debug, Clone)]
pub struct QueuedDispatch {
    pub job_id: JobId,
    pub node: NodeIndex,
    pub path: NodePath,
    pub requirement: AgentRequirement,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for QueuedDispatch {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id && self.node == other.node
    }
}

impl Eq for QueuedDispatch {}

impl PartialOrd for QueuedDispatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedDispatch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then first come first served
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub struct QueueManager {
    queue: BinaryHeap<QueuedDispatch>,
    members: HashSet<(JobId, NodeIndex)>,
    seq: u64,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step. Returns false if it is already queued.
    pub fn enqueue(
        &mut self,
        job_id: JobId,
        node: NodeIndex,
        path: NodePath,
        requirement: AgentRequirement,
        priority: i32,
    ) -> bool {
        if !self.members.insert((job_id, node)) {
            return false;
        }
        self.seq += 1;
        self.queue.push(QueuedDispatch {
            job_id,
            node,
            path,
            requirement,
            priority,
            queued_at: Utc::now(),
            seq: self.seq,
        });
        true
    }

    /// Put back an entry taken by [`QueueManager::drain`], keeping its place.
    pub fn requeue(&mut self, item: QueuedDispatch) {
        if self.members.insert((item.job_id, item.node)) {
            self.queue.push(item);
        }
    }

    /// Take every entry, highest priority first.
    pub fn drain(&mut self) -> Vec<QueuedDispatch> {
        self.members.clear();
        let mut items = std::mem::take(&mut self.queue).into_sorted_vec();
        items.reverse();
        items
    }

    /// Forget every entry of a job, e.g. once it is cancelled.
    pub fn remove_job(&mut self, job_id: JobId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|q| q.job_id != job_id);
        self.members.retain(|(j, _)| *j != job_id);
        before - self.queue.len()
    }

    pub fn contains(&self, job_id: JobId, node: NodeIndex) -> bool {
        self.members.contains(&(job_id, node))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Position of the job's first entry in dispatch order.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        let mut sorted: Vec<_> = self.queue.iter().collect();
        sorted.sort_by(|a, b| b.cmp(a));
        sorted.iter().position(|q| q.job_id == job_id)
    }
}
