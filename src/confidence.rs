use crate::types::Confidence;

/// An independent verification channel reporting success for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Echo,
    FileAck,
    McpAck,
    Activity,
    /// Optimistic echo policy: the verification window elapsed and the
    /// delivery is resolved at base confidence instead of retried.
    TimeoutFallback,
}

impl SignalKind {
    pub fn confidence(self) -> Confidence {
        match self {
            SignalKind::Echo => Confidence::Echoed,
            SignalKind::FileAck => Confidence::FileAcked,
            SignalKind::McpAck => Confidence::McpAcked,
            SignalKind::Activity => Confidence::Active,
            SignalKind::TimeoutFallback => Confidence::Injected,
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            SignalKind::Echo => "echo",
            SignalKind::FileAck => "file_ack",
            SignalKind::McpAck => "mcp_ack",
            SignalKind::Activity => "activity",
            SignalKind::TimeoutFallback => "timeout_fallback",
        }
    }
}

/// What happened to a signal that arrived after the delivery was already
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateOutcome {
    /// Activity outranks the resolving channel; confidence rises.
    Upgraded(Confidence),
    /// Logged for observability, otherwise ignored.
    Logged,
}

/// Per-delivery signal merge. The first successful signal wins and fixes
/// the resolution; afterwards only the activity heuristic can still raise
/// confidence, everything else is log-only.
#[derive(Debug, Clone)]
pub struct ConfidenceLedger {
    current: Confidence,
    resolved_by: SignalKind,
}

impl ConfidenceLedger {
    pub fn resolved(kind: SignalKind) -> Self {
        Self {
            current: kind.confidence(),
            resolved_by: kind,
        }
    }

    pub fn confidence(&self) -> Confidence {
        self.current
    }

    pub fn resolved_by(&self) -> SignalKind {
        self.resolved_by
    }

    pub fn record_late(&mut self, kind: SignalKind) -> LateOutcome {
        let candidate = kind.confidence();
        if kind == SignalKind::Activity && candidate.level() > self.current.level() {
            self.current = candidate;
            return LateOutcome::Upgraded(candidate);
        }
        LateOutcome::Logged
    }
}
