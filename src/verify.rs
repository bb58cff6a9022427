use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::confidence::{ConfidenceLedger, LateOutcome, SignalKind};
use crate::echo::{EchoOutcome, EchoProbe, EchoWindow};
use crate::types::{
    Confidence, DeliveryStatus, FailReason, InjectionBlock, PendingDelivery, SendEvent,
};

/// Resolved delivery ids kept around for duplicate suppression and
/// late-signal accounting.
const RESOLVED_KEEP: usize = 256;

/// What to do when the verification window elapses with no signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EchoPolicy {
    /// Retry up to max_attempts, then fail.
    Strict,
    /// Resolve at base confidence; some wrapped programs never echo.
    Optimistic,
}

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub window: Duration,
    pub max_attempts: u32,
    pub echo_policy: EchoPolicy,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(5000),
            max_attempts: 3,
            echo_policy: EchoPolicy::Strict,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("delivery {0} is already live or resolved")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub delivery_ids: Vec<String>,
    pub confidence: Confidence,
    pub method: &'static str,
    pub attempt: u32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerAction {
    Resolved(Resolution),
    /// Re-queue the block; member attempts have already been bumped.
    Retry { block: InjectionBlock },
    Failed {
        delivery_ids: Vec<String>,
        reason: FailReason,
    },
    /// Session ended with redelivery enabled; the broker re-sends these.
    Requeued { delivery_ids: Vec<String> },
}

#[derive(Debug)]
struct InFlight {
    block: InjectionBlock,
    probe: EchoProbe,
    injected_at: Instant,
    deadline: Instant,
    echo_evicted: bool,
}

/// Per-session arena of live deliveries plus the in-flight verification
/// timers. All state is session-local; the session actor is the only
/// caller.
#[derive(Debug)]
pub struct DeliveryTracker {
    cfg: VerifyConfig,
    table: HashMap<String, PendingDelivery>,
    in_flight: Vec<InFlight>,
    resolved: HashMap<String, ConfidenceLedger>,
    resolved_order: VecDeque<String>,
}

impl DeliveryTracker {
    pub fn new(cfg: VerifyConfig) -> Self {
        Self {
            cfg,
            table: HashMap::new(),
            in_flight: Vec::new(),
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
        }
    }

    pub fn live_len(&self) -> usize {
        self.table.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Accept a SEND from the broker. Duplicates of live or verified
    /// deliveries are rejected; failed ids may be re-sent (broker-side
    /// redelivery is legitimate).
    pub fn admit(&mut self, event: SendEvent, now: Instant) -> Result<PendingDelivery, AdmitError> {
        if self.table.contains_key(&event.id) || self.resolved.contains_key(&event.id) {
            return Err(AdmitError::Duplicate(event.id));
        }
        let delivery = PendingDelivery::new(event, self.cfg.max_attempts, now);
        self.table.insert(delivery.id.clone(), delivery.clone());
        Ok(delivery)
    }

    pub fn mark_queued(&mut self, ids: &[String]) {
        for id in ids {
            self.transition(id, DeliveryStatus::Queued);
        }
    }

    /// A block was written to the PTY; start the verification clock.
    pub fn mark_injected(&mut self, block: &InjectionBlock, probe: EchoProbe, now: Instant) {
        for id in &block.delivery_ids {
            self.transition(id, DeliveryStatus::Injected);
            if let Some(delivery) = self.table.get_mut(id) {
                delivery.raise_confidence(Confidence::Injected);
            }
        }
        self.in_flight.push(InFlight {
            block: block.clone(),
            probe,
            injected_at: now,
            deadline: now + self.cfg.window,
            echo_evicted: false,
        });
    }

    /// Check every in-flight probe against the echo window. Eviction is
    /// recorded as inconclusive; other channels keep their chance.
    pub fn scan_output(&mut self, window: &EchoWindow, now: Instant) -> Vec<TrackerAction> {
        let mut matched = Vec::new();
        for (idx, flight) in self.in_flight.iter_mut().enumerate() {
            match flight.probe.check(window) {
                EchoOutcome::Matched => matched.push(idx),
                EchoOutcome::Evicted if !flight.echo_evicted => {
                    flight.echo_evicted = true;
                    tracing::debug!(
                        target = "courier::verify",
                        token = %flight.block.token,
                        "echo token evicted from window before match; inconclusive"
                    );
                }
                _ => {}
            }
        }
        matched
            .into_iter()
            .rev()
            .map(|idx| TrackerAction::Resolved(self.resolve(idx, SignalKind::Echo, now)))
            .collect()
    }

    /// A file or MCP ack named this delivery id. Resolves the whole block
    /// it was written with; late and unknown signals are logged only.
    pub fn signal_ack(
        &mut self,
        delivery_id: &str,
        kind: SignalKind,
        now: Instant,
    ) -> Option<TrackerAction> {
        if let Some(idx) = self
            .in_flight
            .iter()
            .position(|f| f.block.delivery_ids.iter().any(|id| id == delivery_id))
        {
            return Some(TrackerAction::Resolved(self.resolve(idx, kind, now)));
        }
        match self.resolved.get_mut(delivery_id) {
            Some(ledger) => {
                ledger.record_late(kind);
                tracing::debug!(
                    target = "courier::verify",
                    delivery_id,
                    method = kind.method(),
                    "late signal for already-resolved delivery"
                );
            }
            None => {
                tracing::debug!(
                    target = "courier::verify",
                    delivery_id,
                    method = kind.method(),
                    "signal for unknown delivery id"
                );
            }
        }
        None
    }

    /// Activity observed for an in-flight block resolves it at L3.
    pub fn resolve_by_token(&mut self, token: &str, now: Instant) -> Option<TrackerAction> {
        let idx = self.in_flight.iter().position(|f| f.block.token == token)?;
        Some(TrackerAction::Resolved(self.resolve(
            idx,
            SignalKind::Activity,
            now,
        )))
    }

    /// Activity observed after resolution upgrades confidence. Returns the
    /// ids whose confidence actually rose.
    pub fn upgrade_active(&mut self, ids: &[String]) -> Vec<String> {
        let mut upgraded = Vec::new();
        for id in ids {
            if let Some(ledger) = self.resolved.get_mut(id) {
                if let LateOutcome::Upgraded(_) = ledger.record_late(SignalKind::Activity) {
                    upgraded.push(id.clone());
                }
            }
        }
        upgraded
    }

    /// Fail a block that never reached the PTY (write error or queue drop).
    pub fn fail_block(&mut self, block: &InjectionBlock, reason: FailReason) -> TrackerAction {
        let ids = self.remove_members(&block.delivery_ids, DeliveryStatus::Failed);
        TrackerAction::Failed {
            delivery_ids: ids,
            reason,
        }
    }

    /// Deadline sweep. Strict policy retries then fails; optimistic policy
    /// resolves at base confidence.
    pub fn tick(&mut self, now: Instant) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        let mut idx = 0;
        while idx < self.in_flight.len() {
            if now < self.in_flight[idx].deadline {
                idx += 1;
                continue;
            }
            match self.cfg.echo_policy {
                EchoPolicy::Optimistic => {
                    actions.push(TrackerAction::Resolved(self.resolve(
                        idx,
                        SignalKind::TimeoutFallback,
                        now,
                    )));
                }
                EchoPolicy::Strict => {
                    let mut flight = self.in_flight.swap_remove(idx);
                    if flight.block.attempt < self.cfg.max_attempts {
                        flight.block.attempt += 1;
                        for id in &flight.block.delivery_ids {
                            self.transition(id, DeliveryStatus::Retry);
                            if let Some(delivery) = self.table.get_mut(id) {
                                delivery.attempt = flight.block.attempt;
                            }
                        }
                        actions.push(TrackerAction::Retry {
                            block: flight.block,
                        });
                    } else {
                        let ids = self
                            .remove_members(&flight.block.delivery_ids, DeliveryStatus::Failed);
                        actions.push(TrackerAction::Failed {
                            delivery_ids: ids,
                            reason: FailReason::MaxRetriesExceeded,
                        });
                    }
                }
            }
        }
        actions
    }

    /// Session teardown: cancel every timer and dispose of everything still
    /// live, either as failures or as redelivery candidates.
    pub fn drain_all(&mut self, redeliver: bool) -> Vec<TrackerAction> {
        self.in_flight.clear();
        let ids: Vec<String> = self.table.keys().cloned().collect();
        if ids.is_empty() {
            return Vec::new();
        }
        if redeliver {
            self.table.clear();
            vec![TrackerAction::Requeued { delivery_ids: ids }]
        } else {
            let ids = self.remove_members(&ids, DeliveryStatus::Failed);
            vec![TrackerAction::Failed {
                delivery_ids: ids,
                reason: FailReason::SessionTerminated,
            }]
        }
    }

    fn resolve(&mut self, idx: usize, kind: SignalKind, now: Instant) -> Resolution {
        let flight = self.in_flight.swap_remove(idx);
        let confidence = kind.confidence();
        let mut ids = Vec::with_capacity(flight.block.delivery_ids.len());
        for id in &flight.block.delivery_ids {
            self.transition(id, DeliveryStatus::Verified);
            if let Some(mut delivery) = self.table.remove(id) {
                delivery.raise_confidence(confidence);
                ids.push(delivery.id);
            } else {
                ids.push(id.clone());
            }
            self.remember_resolved(id.clone(), ConfidenceLedger::resolved(kind));
        }
        Resolution {
            delivery_ids: ids,
            confidence,
            method: kind.method(),
            attempt: flight.block.attempt,
            latency_ms: now.duration_since(flight.injected_at).as_millis() as u64,
        }
    }

    fn remember_resolved(&mut self, id: String, ledger: ConfidenceLedger) {
        if self.resolved.insert(id.clone(), ledger).is_none() {
            self.resolved_order.push_back(id);
        }
        while self.resolved_order.len() > RESOLVED_KEEP {
            if let Some(evicted) = self.resolved_order.pop_front() {
                self.resolved.remove(&evicted);
            }
        }
    }

    fn remove_members(&mut self, ids: &[String], terminal: DeliveryStatus) -> Vec<String> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            self.transition(id, terminal);
            if self.table.remove(id).is_some() {
                removed.push(id.clone());
            }
        }
        removed
    }

    fn transition(&mut self, id: &str, next: DeliveryStatus) {
        if let Some(delivery) = self.table.get_mut(id) {
            if let Err(error) = delivery.advance(next) {
                debug_assert!(false, "{error}");
                tracing::error!(target = "courier::verify", %error, "refusing transition");
            }
        }
    }
}
