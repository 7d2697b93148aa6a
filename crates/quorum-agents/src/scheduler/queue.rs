use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use chrono::{DateTime, Utc};
use quorum_models::PriorityTier;
use uuid::Uuid;

/// A ready task waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub request_id: Uuid,
    pub task_id: Uuid,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl Ord for QueueEntry {
    /// Greater pops first: higher priority, then older task, then earlier push.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Lane {
    tier: PriorityTier,
    max_concurrency: Option<usize>,
    ready: BinaryHeap<QueueEntry>,
    running: usize,
    /// Tasks not yet terminal: ready, blocked on prerequisites, or running.
    outstanding: usize,
}

impl Lane {
    fn hard_cap(&self) -> usize {
        self.max_concurrency.unwrap_or(usize::MAX)
    }
}

/// Ready queue partitioned by ticker group.
///
/// A group with outstanding work is active. Each active group is entitled to
/// `ceil(pool / active)` running slots; while any group under its entitlement
/// has ready work, groups at or over it wait. Slots no entitled group can use
/// are lent to the others, so the pool never idles while work is ready. Within
/// the entitled set, the most urgent tier goes first, then the group running
/// the fewest tasks, then the best head-of-queue entry.
#[derive(Debug)]
pub struct FairQueue {
    pool_size: usize,
    lanes: BTreeMap<String, Lane>,
    next_seq: u64,
}

impl FairQueue {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            lanes: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Announce `tasks` new outstanding tasks for a group. A group already
    /// active keeps the more urgent of its current and the new tier.
    pub fn open_lane(
        &mut self,
        group_id: &str,
        tier: PriorityTier,
        max_concurrency: Option<usize>,
        tasks: usize,
    ) {
        let lane = self.lanes.entry(group_id.to_string()).or_insert_with(|| Lane {
            tier,
            max_concurrency,
            ready: BinaryHeap::new(),
            running: 0,
            outstanding: 0,
        });
        lane.tier = lane.tier.min(tier);
        if max_concurrency.is_some() {
            lane.max_concurrency = max_concurrency;
        }
        lane.outstanding += tasks;
    }

    /// Make a task ready. The lane must have been opened.
    pub fn push(
        &mut self,
        group_id: &str,
        request_id: Uuid,
        task_id: Uuid,
        priority: u8,
        created_at: DateTime<Utc>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(lane) = self.lanes.get_mut(group_id) {
            lane.ready.push(QueueEntry {
                request_id,
                task_id,
                priority,
                created_at,
                seq,
            });
        }
    }

    fn fair_share(&self) -> usize {
        let active = self.lanes.len().max(1);
        self.pool_size.div_ceil(active).max(1)
    }

    /// Best lane with ready work that is running below `limit(lane)`.
    fn pick(&self, limit: impl Fn(&Lane) -> usize) -> Option<String> {
        self.lanes
            .iter()
            .filter(|(_, lane)| !lane.ready.is_empty() && lane.running < limit(lane))
            .min_by(|(_, a), (_, b)| {
                a.tier
                    .cmp(&b.tier)
                    .then_with(|| a.running.cmp(&b.running))
                    .then_with(|| b.ready.peek().cmp(&a.ready.peek()))
            })
            .map(|(group, _)| group.clone())
    }

    /// Take the next entry to dispatch. The caller reports the outcome with
    /// [`mark_running`](Self::mark_running) or [`mark_terminal`](Self::mark_terminal).
    pub fn pop(&mut self) -> Option<(String, QueueEntry)> {
        let share = self.fair_share();
        let group = self
            .pick(|lane| share.min(lane.hard_cap()))
            .or_else(|| self.pick(Lane::hard_cap))?;
        let entry = self.lanes.get_mut(&group)?.ready.pop()?;
        Some((group, entry))
    }

    pub fn mark_running(&mut self, group_id: &str) {
        if let Some(lane) = self.lanes.get_mut(group_id) {
            lane.running += 1;
        }
    }

    /// A worker returned. The task may still be retried.
    pub fn release(&mut self, group_id: &str) {
        if let Some(lane) = self.lanes.get_mut(group_id) {
            lane.running = lane.running.saturating_sub(1);
        }
    }

    /// A task reached a terminal state. The lane closes with its last task.
    pub fn mark_terminal(&mut self, group_id: &str) {
        let close = match self.lanes.get_mut(group_id) {
            Some(lane) => {
                lane.outstanding = lane.outstanding.saturating_sub(1);
                lane.outstanding == 0
            }
            None => false,
        };
        if close {
            self.lanes.remove(group_id);
        }
    }

    /// Remove every ready entry of a request, returning `(group, task)` pairs.
    pub fn drain_request(&mut self, request_id: Uuid) -> Vec<(String, Uuid)> {
        let mut drained = Vec::new();
        for (group, lane) in &mut self.lanes {
            let entries = std::mem::take(&mut lane.ready).into_vec();
            let (removed, kept): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|e| e.request_id == request_id);
            lane.ready = kept.into_iter().collect();
            drained.extend(removed.into_iter().map(|e| (group.clone(), e.task_id)));
        }
        drained
    }

    pub fn ready_len(&self) -> usize {
        self.lanes.values().map(|l| l.ready.len()).sum()
    }

    pub fn running(&self, group_id: &str) -> usize {
        self.lanes.get(group_id).map(|l| l.running).unwrap_or(0)
    }

    pub fn active_groups(&self) -> usize {
        self.lanes.len()
    }
}
