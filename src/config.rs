use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::scheduler::SchedulerConfig;
use crate::session::SessionConfig;
use crate::verify::{EchoPolicy, VerifyConfig};

/// Injection and verification knobs shared by every run mode. Defaults are
/// the production values; anything latency-sensitive is overridable per
/// wrapped-program profile.
#[derive(Debug, Clone, Args)]
pub struct Tuning {
    /// Hold P2-P4 writes for this long after a human keystroke (ms).
    #[arg(long, default_value_t = 3000)]
    pub human_cooldown: u64,

    /// Merge same-sender messages arriving within this window (ms).
    #[arg(long, default_value_t = 500)]
    pub coalesce_window: u64,

    /// Hard cap on how long a coalescing group may be held open (ms).
    #[arg(long, default_value_t = 2000)]
    pub coalesce_max_hold: u64,

    /// Per-session queue cap in messages.
    #[arg(long, default_value_t = 200)]
    pub queue_max: usize,

    /// Per-session queue cap in bytes.
    #[arg(long, default_value_t = 5 * 1024 * 1024)]
    pub queue_max_bytes: usize,

    /// Injection attempts per delivery before giving up.
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Verification window per attempt (ms). Slow agents want up to 15000.
    #[arg(long, default_value_t = 5000)]
    pub verify_window: u64,

    /// What a verification timeout means for this wrapped program.
    #[arg(long, value_enum, default_value = "strict")]
    pub echo_policy: EchoPolicy,

    /// Quiet period of child output treated as a safe write moment (ms).
    #[arg(long, default_value_t = 150)]
    pub idle_quiet: u64,

    /// Echo window capacity in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    pub echo_window_bytes: usize,

    /// Directory to poll for sidecar ack files; disabled when absent.
    #[arg(long)]
    pub ack_dir: Option<PathBuf>,

    /// Emit delivery_active when output matches tool-use patterns.
    #[arg(long)]
    pub progress: bool,

    /// On session end, mark outstanding deliveries for broker redelivery
    /// instead of failing them.
    #[arg(long)]
    pub redeliver_on_exit: bool,

    /// Silence before session_idle fires, in seconds (0 = disabled).
    #[arg(long, default_value_t = 30)]
    pub idle_threshold_secs: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Tuning {
    pub fn session_config(&self, agent_name: String, cli: String) -> SessionConfig {
        SessionConfig {
            agent_name,
            cli,
            scheduler: SchedulerConfig {
                coalesce_window: Duration::from_millis(self.coalesce_window),
                coalesce_max_hold: Duration::from_millis(self.coalesce_max_hold),
                human_cooldown: Duration::from_millis(self.human_cooldown),
                queue_max_items: self.queue_max,
                queue_max_bytes: self.queue_max_bytes,
            },
            verify: VerifyConfig {
                window: Duration::from_millis(self.verify_window),
                max_attempts: self.max_attempts,
                echo_policy: self.echo_policy,
            },
            idle_quiet: Duration::from_millis(self.idle_quiet),
            echo_window_bytes: self.echo_window_bytes,
            ack_dir: self.ack_dir.clone(),
            progress: self.progress,
            redeliver_on_exit: self.redeliver_on_exit,
            idle_threshold: (self.idle_threshold_secs > 0)
                .then(|| Duration::from_secs(self.idle_threshold_secs)),
        }
    }
}
