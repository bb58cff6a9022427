use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::queue::{BoundedPriorityQueue, QueueFull};
use crate::types::{InjectionBlock, PendingDelivery, Priority};

/// Coalesced body ceiling (32 KiB). A group that would exceed it is flushed
/// and the new message starts a fresh window.
const MAX_COALESCED_BODY_BYTES: usize = 32 * 1024;

/// Keystroke timestamps shared with the passthrough reader. The reader only
/// writes a timestamp; the scheduler only reads it. Nobody blocks on it.
#[derive(Debug, Default)]
pub struct HumanActivityState {
    last_keystroke: Mutex<Option<Instant>>,
}

impl HumanActivityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_keystroke(&self, now: Instant) {
        *self.last_keystroke.lock() = Some(now);
    }

    pub fn last_keystroke(&self) -> Option<Instant> {
        *self.last_keystroke.lock()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub coalesce_window: Duration,
    pub coalesce_max_hold: Duration,
    pub human_cooldown: Duration,
    pub queue_max_items: usize,
    pub queue_max_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(500),
            coalesce_max_hold: Duration::from_millis(2000),
            human_cooldown: Duration::from_millis(3000),
            queue_max_items: 200,
            queue_max_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Blocks that left the queue without being written: `dropped` were evicted
/// by backpressure, `rejected` could not be admitted at all (only P0/P1
/// ahead of them).
#[derive(Debug, Default)]
pub struct EnqueueReport {
    pub dropped: Vec<InjectionBlock>,
    pub rejected: Vec<InjectionBlock>,
}

impl EnqueueReport {
    pub fn is_empty(&self) -> bool {
        self.dropped.is_empty() && self.rejected.is_empty()
    }

    fn merge(&mut self, other: EnqueueReport) {
        self.dropped.extend(other.dropped);
        self.rejected.extend(other.rejected);
    }
}

#[derive(Debug)]
struct CoalesceGroup {
    block: InjectionBlock,
    first_seen: Instant,
    last_seen: Instant,
    flush_at: Instant,
}

/// Sole authority over what gets written into a PTY and when. P0 bytes
/// never pass through here; P1 skips every gate; P2-P4 wait for the human
/// cooldown and an idle window.
#[derive(Debug)]
pub struct InjectionScheduler {
    cfg: SchedulerConfig,
    human: Arc<HumanActivityState>,
    groups: HashMap<(String, String), CoalesceGroup>,
    queue: BoundedPriorityQueue<InjectionBlock>,
}

impl InjectionScheduler {
    pub fn new(cfg: SchedulerConfig, human: Arc<HumanActivityState>) -> Self {
        let queue = BoundedPriorityQueue::new(cfg.queue_max_items, cfg.queue_max_bytes);
        Self {
            cfg,
            human,
            groups: HashMap::new(),
            queue,
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || !self.groups.is_empty()
    }

    /// Accept a delivery the tracker just admitted. P1 is enqueued
    /// immediately; lower tiers join or open a coalescing group.
    pub fn offer(&mut self, delivery: &PendingDelivery, now: Instant) -> EnqueueReport {
        if delivery.priority <= Priority::P1 {
            return self.enqueue(InjectionBlock::for_delivery(delivery));
        }

        let key = (delivery.sender.clone(), delivery.recipient.clone());
        let mut report = EnqueueReport::default();

        if let Some(group) = self.groups.get_mut(&key) {
            let within_window = now.duration_since(group.last_seen) <= self.cfg.coalesce_window;
            let within_hold = now.duration_since(group.first_seen) <= self.cfg.coalesce_max_hold;
            let within_size =
                group.block.body_bytes() + 1 + delivery.body.len() <= MAX_COALESCED_BODY_BYTES;
            if within_window && within_hold && within_size {
                group.block.absorb(delivery);
                group.last_seen = now;
                group.flush_at = std::cmp::min(
                    group.first_seen + self.cfg.coalesce_max_hold,
                    now + self.cfg.coalesce_window,
                );
                return report;
            }
            if let Some(stale) = self.groups.remove(&key) {
                report.merge(self.enqueue(stale.block));
            }
        }

        self.groups.insert(
            key,
            CoalesceGroup {
                block: InjectionBlock::for_delivery(delivery),
                first_seen: now,
                last_seen: now,
                flush_at: now + self.cfg.coalesce_window,
            },
        );
        report
    }

    /// Close every coalescing window whose deadline has passed and move the
    /// blocks into the priority queue.
    pub fn flush_due(&mut self, now: Instant) -> EnqueueReport {
        let due: Vec<(String, String)> = self
            .groups
            .iter()
            .filter(|(_, g)| now >= g.flush_at)
            .map(|(k, _)| k.clone())
            .collect();

        let mut report = EnqueueReport::default();
        for key in due {
            if let Some(group) = self.groups.remove(&key) {
                report.merge(self.enqueue(group.block));
            }
        }
        report
    }

    /// Put a retried block straight back into the queue, skipping
    /// coalescing.
    pub fn requeue(&mut self, block: InjectionBlock) -> EnqueueReport {
        self.enqueue(block)
    }

    /// The next write to perform, if gating allows one right now. P1 is
    /// served regardless of cooldown or idle state.
    pub fn pop_ready(&mut self, now: Instant, idle: bool) -> Option<InjectionBlock> {
        if let Some(block) = self.queue.pop_up_to(Priority::P1) {
            return Some(block);
        }
        if self.in_cooldown(now) || !idle {
            return None;
        }
        self.queue.pop()
    }

    /// P1 only; used while throttle spacing holds the gated tiers back.
    pub fn pop_urgent(&mut self) -> Option<InjectionBlock> {
        self.queue.pop_up_to(Priority::P1)
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.human
            .last_keystroke()
            .map(|last| now.duration_since(last) < self.cfg.human_cooldown)
            .unwrap_or(false)
    }

    /// When the current cooldown ends, if one is running.
    pub fn cooldown_ends(&self, now: Instant) -> Option<Instant> {
        let last = self.human.last_keystroke()?;
        let ends = last + self.cfg.human_cooldown;
        (ends > now).then_some(ends)
    }

    /// Earliest coalescing deadline, for the session's wakeup computation.
    pub fn next_flush_at(&self) -> Option<Instant> {
        self.groups.values().map(|g| g.flush_at).min()
    }

    /// Everything still held, for session teardown.
    pub fn drain(&mut self) -> Vec<InjectionBlock> {
        let mut blocks: Vec<InjectionBlock> = self.groups.drain().map(|(_, g)| g.block).collect();
        blocks.extend(self.queue.drain());
        blocks
    }

    fn enqueue(&mut self, block: InjectionBlock) -> EnqueueReport {
        let mut report = EnqueueReport::default();
        match self.queue.push_with_overflow(block) {
            Ok(dropped) => report.dropped = dropped,
            Err(QueueFull(block)) => {
                tracing::warn!(
                    target = "courier::scheduler",
                    token = %block.token,
                    "queue full of undroppable traffic; rejecting incoming block"
                );
                report.rejected.push(block);
            }
        }
        report
    }
}
