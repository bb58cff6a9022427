use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::types::Confidence;

pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Everything a session reports outward, in per-session order. Exactly one
/// terminal event (`delivery_ack`, `delivery_failed` or `delivery_requeued`)
/// fires per delivery id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    DeliveryQueued {
        delivery_id: String,
        agent: String,
    },
    DeliveryInjected {
        delivery_id: String,
        agent: String,
        attempt: u32,
    },
    DeliveryAck {
        delivery_id: String,
        agent: String,
        confidence: Confidence,
        method: String,
        attempt: u32,
        latency_ms: u64,
    },
    DeliveryActive {
        delivery_id: String,
        agent: String,
        pattern: String,
    },
    DeliveryRetry {
        delivery_id: String,
        agent: String,
        attempt: u32,
    },
    DeliveryFailed {
        delivery_id: String,
        agent: String,
        reason: String,
    },
    /// Backpressure accounting; the per-delivery terminal event is the
    /// matching `delivery_failed{reason=queue_overflow}`.
    DeliveryDropped {
        agent: String,
        count: usize,
        reason: String,
    },
    DeliveryRequeued {
        delivery_id: String,
        agent: String,
    },
    SessionIdle {
        agent: String,
        idle_secs: u64,
    },
    SessionTerminated {
        agent: String,
        reason: String,
    },
}

/// JSON-lines event sink for modes that report on a std stream rather than
/// a control socket.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    to_stdout: bool,
}

impl EventEmitter {
    pub fn stdout() -> Self {
        Self { to_stdout: true }
    }

    pub fn stderr() -> Self {
        Self { to_stdout: false }
    }

    pub fn emit(&self, event: &SessionEvent) {
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "payload": event,
        });
        if self.to_stdout {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{line}");
        } else {
            let mut out = io::stderr().lock();
            let _ = writeln!(out, "{line}");
        }
    }
}
