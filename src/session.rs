use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::ack::AckWatcher;
use crate::activity::{ActivityDetector, ActivityMonitor};
use crate::ansi::strip_ansi;
use crate::confidence::SignalKind;
use crate::echo::{EchoProbe, EchoWindow};
use crate::events::SessionEvent;
use crate::pty::{PtyController, StatusQueryResponder};
use crate::scheduler::{EnqueueReport, HumanActivityState, InjectionScheduler, SchedulerConfig};
use crate::throttle::{DeliveryOutcome, ThrottleState};
use crate::types::{FailReason, SendEvent};
use crate::verify::{DeliveryTracker, TrackerAction, VerifyConfig};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent_name: String,
    /// The wrapped program, used to pick activity patterns.
    pub cli: String,
    pub scheduler: SchedulerConfig,
    pub verify: VerifyConfig,
    pub idle_quiet: Duration,
    pub echo_window_bytes: usize,
    pub ack_dir: Option<PathBuf>,
    pub progress: bool,
    pub redeliver_on_exit: bool,
    pub idle_threshold: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Deliver(SendEvent),
    McpAck { delivery_id: String, status: String },
    Resize { rows: u16, cols: u16 },
    Shutdown { reason: Option<String> },
}

struct Session {
    cfg: SessionConfig,
    pty: PtyController,
    events: mpsc::Sender<SessionEvent>,
    output: Option<mpsc::Sender<Vec<u8>>>,
    tracker: DeliveryTracker,
    scheduler: InjectionScheduler,
    echo_window: EchoWindow,
    activity: Option<ActivityMonitor>,
    acks: Option<AckWatcher>,
    throttle: ThrottleState,
    responder: StatusQueryResponder,
    last_output: Instant,
    idle_reported: bool,
    next_write_at: Instant,
    end_reason: Option<String>,
}

/// One session = one wrapped program = one single-threaded event loop.
/// All per-session state lives inside this task; other sessions and the
/// broker only ever see the event stream.
pub async fn run_session(
    cfg: SessionConfig,
    pty: PtyController,
    mut pty_rx: mpsc::Receiver<Vec<u8>>,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    output: Option<mpsc::Sender<Vec<u8>>>,
    human: Arc<HumanActivityState>,
) -> Result<()> {
    let detector = ActivityDetector::for_cli(&cfg.cli);
    let mut session = Session {
        tracker: DeliveryTracker::new(cfg.verify.clone()),
        scheduler: InjectionScheduler::new(cfg.scheduler.clone(), human),
        echo_window: EchoWindow::new(cfg.echo_window_bytes),
        activity: cfg.progress.then(|| ActivityMonitor::new(detector)),
        acks: cfg.ack_dir.clone().map(AckWatcher::new),
        throttle: ThrottleState::default(),
        responder: StatusQueryResponder::default(),
        last_output: Instant::now(),
        idle_reported: false,
        next_write_at: Instant::now(),
        end_reason: None,
        events,
        output,
        pty,
        cfg,
    };

    let mut verify_tick = tokio::time::interval(Duration::from_millis(200));
    verify_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ack_tick = tokio::time::interval(Duration::from_millis(250));
    ack_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut watchdog_tick = tokio::time::interval(Duration::from_secs(5));
    watchdog_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while session.end_reason.is_none() {
        let wakeup = tokio::time::Instant::from_std(session.next_wakeup(Instant::now()));
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => session.handle_command(cmd).await,
                None => session.end_reason = Some("control_closed".to_string()),
            },
            chunk = pty_rx.recv() => match chunk {
                Some(chunk) => session.handle_chunk(chunk).await,
                None => session.end_reason = Some("pty_closed".to_string()),
            },
            _ = verify_tick.tick() => session.verification_tick().await,
            _ = ack_tick.tick(), if session.acks.is_some() => session.poll_acks().await,
            _ = watchdog_tick.tick() => session.watchdog().await,
            _ = tokio::time::sleep_until(wakeup) => {}
        }
        session.pump().await;
    }

    let reason = session
        .end_reason
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    session.drain_late_output(&mut pty_rx).await;
    session.teardown(reason).await;
    Ok(())
}

impl Session {
    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Deliver(event) => self.handle_deliver(event).await,
            SessionCommand::McpAck {
                delivery_id,
                status,
            } => {
                if status == "received" {
                    let action =
                        self.tracker
                            .signal_ack(&delivery_id, SignalKind::McpAck, Instant::now());
                    if let Some(action) = action {
                        self.handle_actions(vec![action]).await;
                    }
                } else {
                    tracing::warn!(
                        target = "courier::session",
                        %delivery_id,
                        %status,
                        "ignoring MCP ack with unexpected status"
                    );
                }
            }
            SessionCommand::Resize { rows, cols } => {
                if let Err(error) = self.pty.resize(rows, cols) {
                    tracing::debug!(target = "courier::session", %error, "resize failed");
                }
            }
            SessionCommand::Shutdown { reason } => {
                self.end_reason = Some(reason.unwrap_or_else(|| "shutdown".to_string()));
            }
        }
    }

    async fn handle_deliver(&mut self, event: SendEvent) {
        let now = Instant::now();
        match self.tracker.admit(event, now) {
            Err(error) => {
                tracing::debug!(target = "courier::session", %error, "skipping duplicate");
            }
            Ok(delivery) => {
                let report = self.scheduler.offer(&delivery, now);
                let rejected = report
                    .rejected
                    .iter()
                    .any(|b| b.delivery_ids.contains(&delivery.id));
                self.report_unwritten(report).await;
                if !rejected {
                    self.tracker.mark_queued(std::slice::from_ref(&delivery.id));
                    self.emit(SessionEvent::DeliveryQueued {
                        delivery_id: delivery.id.clone(),
                        agent: self.cfg.agent_name.clone(),
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_chunk(&mut self, chunk: Vec<u8>) {
        self.last_output = Instant::now();
        self.idle_reported = false;

        for reply in self.responder.feed(&chunk) {
            if self.pty.write_all(reply).is_err() {
                break;
            }
        }

        let text = String::from_utf8_lossy(&chunk).into_owned();
        self.echo_window.push(&text);

        let now = Instant::now();
        let actions = self.tracker.scan_output(&self.echo_window, now);
        self.handle_actions(actions).await;

        let hits = match self.activity.as_mut() {
            Some(monitor) => {
                let clean = strip_ansi(&text);
                monitor.feed(&clean, now)
            }
            None => Vec::new(),
        };
        for hit in hits {
            if let Some(action) = self.tracker.resolve_by_token(&hit.token, now) {
                self.handle_actions(vec![action]).await;
            } else {
                for delivery_id in self.tracker.upgrade_active(&hit.delivery_ids) {
                    self.emit(SessionEvent::DeliveryActive {
                        delivery_id,
                        agent: self.cfg.agent_name.clone(),
                        pattern: hit.pattern.clone(),
                    })
                    .await;
                }
            }
        }

        if let Some(out) = &self.output {
            let _ = out.send(chunk).await;
        }
    }

    /// Close due coalescing windows and perform at most one write if the
    /// gates (cooldown, idle window, throttle spacing) allow it.
    async fn pump(&mut self) {
        let now = Instant::now();
        let report = self.scheduler.flush_due(now);
        self.report_unwritten(report).await;

        let idle = now.duration_since(self.last_output) >= self.cfg.idle_quiet;
        let block = if now >= self.next_write_at {
            self.scheduler.pop_ready(now, idle)
        } else {
            // Throttle spacing applies to gated tiers only.
            self.scheduler.pop_urgent()
        };
        let Some(block) = block else { return };

        let payload = block.payload();
        let mut bytes = payload.clone().into_bytes();
        bytes.push(b'\r');

        match self.pty.write_all(&bytes) {
            Ok(()) => {
                let now = Instant::now();
                let probe = EchoProbe::for_block(&block, &self.echo_window);
                self.tracker.mark_injected(&block, probe, now);
                if let Some(monitor) = self.activity.as_mut() {
                    monitor.track(&block, payload, now);
                }
                for delivery_id in &block.delivery_ids {
                    self.emit(SessionEvent::DeliveryInjected {
                        delivery_id: delivery_id.clone(),
                        agent: self.cfg.agent_name.clone(),
                        attempt: block.attempt,
                    })
                    .await;
                }
                self.next_write_at = now + self.throttle.delay();
            }
            Err(error) => {
                tracing::warn!(
                    target = "courier::session",
                    token = %block.token,
                    %error,
                    "PTY write failed; failing block"
                );
                let action = self.tracker.fail_block(&block, FailReason::PtyClosed);
                self.handle_actions(vec![action]).await;
            }
        }
    }

    async fn verification_tick(&mut self) {
        let now = Instant::now();
        let actions = self.tracker.tick(now);
        self.handle_actions(actions).await;
        if let Some(monitor) = self.activity.as_mut() {
            monitor.expire(now);
        }
    }

    async fn poll_acks(&mut self) {
        let acks = match self.acks.as_mut() {
            Some(watcher) => watcher.poll(),
            None => return,
        };
        for ack in acks {
            if ack.is_received() {
                let action =
                    self.tracker
                        .signal_ack(&ack.delivery_id, SignalKind::FileAck, Instant::now());
                if let Some(action) = action {
                    self.handle_actions(vec![action]).await;
                }
            } else {
                tracing::warn!(
                    target = "courier::session",
                    delivery_id = %ack.delivery_id,
                    status = %ack.status,
                    "ack file with non-received status; not a confirmation"
                );
            }
        }
    }

    async fn watchdog(&mut self) {
        if self.pty.has_exited() {
            self.end_reason = Some("child_exited".to_string());
            return;
        }
        if let Some(threshold) = self.cfg.idle_threshold {
            let silent = self.last_output.elapsed();
            if silent >= threshold && !self.idle_reported {
                self.idle_reported = true;
                self.emit(SessionEvent::SessionIdle {
                    agent: self.cfg.agent_name.clone(),
                    idle_secs: silent.as_secs(),
                })
                .await;
            }
        }
    }

    async fn handle_actions(&mut self, actions: Vec<TrackerAction>) {
        for action in actions {
            match action {
                TrackerAction::Resolved(res) => {
                    self.throttle.record(DeliveryOutcome::Success);
                    for delivery_id in res.delivery_ids {
                        self.emit(SessionEvent::DeliveryAck {
                            delivery_id,
                            agent: self.cfg.agent_name.clone(),
                            confidence: res.confidence,
                            method: res.method.to_string(),
                            attempt: res.attempt,
                            latency_ms: res.latency_ms,
                        })
                        .await;
                    }
                }
                TrackerAction::Retry { block } => {
                    self.throttle.record(DeliveryOutcome::Failure);
                    let ids = block.delivery_ids.clone();
                    let attempt = block.attempt;
                    let report = self.scheduler.requeue(block);
                    let rejected = !report.rejected.is_empty();
                    self.report_unwritten(report).await;
                    if !rejected {
                        self.tracker.mark_queued(&ids);
                        for delivery_id in ids {
                            self.emit(SessionEvent::DeliveryRetry {
                                delivery_id,
                                agent: self.cfg.agent_name.clone(),
                                attempt,
                            })
                            .await;
                        }
                    }
                }
                TrackerAction::Failed {
                    delivery_ids,
                    reason,
                } => {
                    self.throttle.record(DeliveryOutcome::Failure);
                    for delivery_id in delivery_ids {
                        self.emit(SessionEvent::DeliveryFailed {
                            delivery_id,
                            agent: self.cfg.agent_name.clone(),
                            reason: reason.as_str().to_string(),
                        })
                        .await;
                    }
                }
                TrackerAction::Requeued { delivery_ids } => {
                    for delivery_id in delivery_ids {
                        self.emit(SessionEvent::DeliveryRequeued {
                            delivery_id,
                            agent: self.cfg.agent_name.clone(),
                        })
                        .await;
                    }
                }
            }
        }
    }

    /// Backpressure accounting for blocks that never reached the PTY: each
    /// member delivery fails terminally and one dropped event carries the
    /// count.
    async fn report_unwritten(&mut self, report: EnqueueReport) {
        if report.is_empty() {
            return;
        }
        let mut count = 0;
        for block in report.dropped.into_iter().chain(report.rejected) {
            count += block.delivery_ids.len();
            let action = self.tracker.fail_block(&block, FailReason::QueueOverflow);
            if let TrackerAction::Failed { delivery_ids, .. } = action {
                for delivery_id in delivery_ids {
                    self.emit(SessionEvent::DeliveryFailed {
                        delivery_id,
                        agent: self.cfg.agent_name.clone(),
                        reason: FailReason::QueueOverflow.as_str().to_string(),
                    })
                    .await;
                }
            }
        }
        self.emit(SessionEvent::DeliveryDropped {
            agent: self.cfg.agent_name.clone(),
            count,
            reason: "queue_overflow".to_string(),
        })
        .await;
    }

    /// The reader may be ahead of us when the child dies; give pending
    /// verifications one last look at whatever it buffered.
    async fn drain_late_output(&mut self, pty_rx: &mut mpsc::Receiver<Vec<u8>>) {
        let mut drained = false;
        while let Ok(chunk) = pty_rx.try_recv() {
            drained = true;
            let text = String::from_utf8_lossy(&chunk).into_owned();
            self.echo_window.push(&text);
            if let Some(out) = &self.output {
                let _ = out.send(chunk).await;
            }
        }
        if drained {
            let actions = self.tracker.scan_output(&self.echo_window, Instant::now());
            self.handle_actions(actions).await;
        }
    }

    /// Cancel everything and fire the per-delivery terminal events plus the
    /// session-terminated event, exactly once.
    async fn teardown(&mut self, reason: String) {
        let actions = self.tracker.drain_all(self.cfg.redeliver_on_exit);
        for action in actions {
            match action {
                TrackerAction::Failed {
                    delivery_ids,
                    reason,
                } => {
                    for delivery_id in delivery_ids {
                        self.emit(SessionEvent::DeliveryFailed {
                            delivery_id,
                            agent: self.cfg.agent_name.clone(),
                            reason: reason.as_str().to_string(),
                        })
                        .await;
                    }
                }
                TrackerAction::Requeued { delivery_ids } => {
                    for delivery_id in delivery_ids {
                        self.emit(SessionEvent::DeliveryRequeued {
                            delivery_id,
                            agent: self.cfg.agent_name.clone(),
                        })
                        .await;
                    }
                }
                _ => {}
            }
        }
        self.scheduler.drain();
        self.emit(SessionEvent::SessionTerminated {
            agent: self.cfg.agent_name.clone(),
            reason,
        })
        .await;
        let _ = self.pty.shutdown();
    }

    fn next_wakeup(&self, now: Instant) -> Instant {
        // Heartbeat floor so a missed edge never wedges the loop.
        let mut wakeup = now + Duration::from_millis(500);
        let mut consider = |t: Instant| {
            if t > now && t < wakeup {
                wakeup = t;
            }
        };
        if let Some(flush_at) = self.scheduler.next_flush_at() {
            consider(flush_at);
        }
        if self.scheduler.queued_len() > 0 {
            consider(self.last_output + self.cfg.idle_quiet);
            consider(self.next_write_at);
            if let Some(cooldown_end) = self.scheduler.cooldown_ends(now) {
                consider(cooldown_end);
            }
        }
        wakeup
    }
}
