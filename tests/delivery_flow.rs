//! End-to-end exercises of the injection pipeline's pure core: scheduler,
//! tracker, echo window and aggregator driven with explicit clocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use courier::confidence::SignalKind;
use courier::echo::{EchoProbe, EchoWindow};
use courier::scheduler::{HumanActivityState, InjectionScheduler, SchedulerConfig};
use courier::types::{
    Confidence, FailReason, InjectionBlock, PendingDelivery, Priority, SendEvent,
};
use courier::verify::{DeliveryTracker, TrackerAction, VerifyConfig};

fn send(id: &str, from: &str, to: &str, body: &str) -> SendEvent {
    SendEvent {
        id: id.into(),
        from: from.into(),
        to: to.into(),
        body: body.into(),
        priority: None,
        thread_id: None,
    }
}

fn scheduler() -> InjectionScheduler {
    InjectionScheduler::new(
        SchedulerConfig::default(),
        Arc::new(HumanActivityState::new()),
    )
}

/// Scenario A: the child echoes the exact injected string within 150ms;
/// the ack fires with echo confidence and no retries.
#[test]
fn prompt_echo_acks_first_attempt() {
    let mut tracker = DeliveryTracker::new(VerifyConfig::default());
    let mut sched = scheduler();
    let mut window = EchoWindow::new(64 * 1024);
    let t0 = Instant::now();

    let delivery = tracker
        .admit(send("abc123", "Alice", "Bob", "Please review PR #42"), t0)
        .unwrap();
    assert!(sched.offer(&delivery, t0).is_empty());
    tracker.mark_queued(std::slice::from_ref(&delivery.id));

    sched.flush_due(t0 + Duration::from_millis(501));
    let block = sched
        .pop_ready(t0 + Duration::from_millis(501), true)
        .expect("block ready after coalesce window");

    let injected_at = t0 + Duration::from_millis(520);
    let probe = EchoProbe::for_block(&block, &window);
    tracker.mark_injected(&block, probe, injected_at);

    window.push(&format!("{}\r\n", block.payload()));
    let actions = tracker.scan_output(&window, injected_at + Duration::from_millis(150));

    assert_eq!(actions.len(), 1);
    match &actions[0] {
        TrackerAction::Resolved(res) => {
            assert_eq!(res.delivery_ids, vec!["abc123"]);
            assert_eq!(res.confidence, Confidence::Echoed);
            assert_eq!(res.method, "echo");
            assert_eq!(res.attempt, 1);
            assert!(res.latency_ms <= 200);
        }
        other => panic!("expected Resolved, got {other:?}"),
    }
    // No retries left behind.
    assert!(tracker.tick(injected_at + Duration::from_secs(60)).is_empty());
}

/// Scenario B: no echo ever appears, but a sidecar ack file lands two
/// seconds after injection. The delivery resolves file-acked; nothing
/// fails.
#[test]
fn file_ack_rescues_silent_child() {
    let mut tracker = DeliveryTracker::new(VerifyConfig::default());
    let window = EchoWindow::new(64 * 1024);
    let t0 = Instant::now();

    let delivery = tracker
        .admit(send("abc123", "Alice", "Bob", "Please review PR #42"), t0)
        .unwrap();
    let block = InjectionBlock::for_delivery(&delivery);
    tracker.mark_queued(&block.delivery_ids);
    let probe = EchoProbe::for_block(&block, &window);
    tracker.mark_injected(&block, probe, t0);

    let action = tracker
        .signal_ack("abc123", SignalKind::FileAck, t0 + Duration::from_secs(2))
        .expect("file ack resolves the delivery");
    match action {
        TrackerAction::Resolved(res) => {
            assert_eq!(res.confidence, Confidence::FileAcked);
            assert_eq!(res.method, "file_ack");
            assert!((1900..=2100).contains(&res.latency_ms));
        }
        other => panic!("expected Resolved, got {other:?}"),
    }
    // The verification deadline later passes without any Failed action.
    assert!(tracker.tick(t0 + Duration::from_secs(10)).is_empty());
}

/// Scenario C: no channel ever confirms. Exactly three injection attempts
/// happen, then a single failure with max_retries_exceeded.
#[test]
fn silent_delivery_fails_after_three_attempts() {
    let mut tracker = DeliveryTracker::new(VerifyConfig::default());
    let mut sched = scheduler();
    let window = EchoWindow::new(64 * 1024);
    let mut now = Instant::now();

    let delivery = tracker
        .admit(send("abc123", "Alice", "Bob", "anyone there?"), now)
        .unwrap();
    sched.offer(&delivery, now);
    tracker.mark_queued(std::slice::from_ref(&delivery.id));
    now += Duration::from_millis(501);
    sched.flush_due(now);

    let mut injections = 0;
    let mut failures = Vec::new();
    loop {
        if let Some(block) = sched.pop_ready(now, true) {
            let probe = EchoProbe::for_block(&block, &window);
            tracker.mark_injected(&block, probe, now);
            injections += 1;
        }
        now += Duration::from_millis(5001);
        let actions = tracker.tick(now);
        if actions.is_empty() {
            break;
        }
        for action in actions {
            match action {
                TrackerAction::Retry { block } => {
                    let report = sched.requeue(block);
                    assert!(report.is_empty());
                    tracker.mark_queued(&["abc123".to_string()]);
                }
                TrackerAction::Failed {
                    delivery_ids,
                    reason,
                } => failures.push((delivery_ids, reason)),
                other => panic!("unexpected action {other:?}"),
            }
        }
        if !failures.is_empty() {
            break;
        }
    }

    assert_eq!(injections, 3);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, vec!["abc123"]);
    assert_eq!(failures[0].1, FailReason::MaxRetriesExceeded);
}

/// Scenario D: 250 P4 blocks against a 200-item cap drop exactly the 50
/// oldest; P1 traffic survives any amount of pressure.
#[test]
fn overflow_drops_exactly_the_oldest_low_priority() {
    let mut sched = scheduler();
    let now = Instant::now();

    let mut dropped = Vec::new();
    for i in 0..250 {
        let mut event = send(&format!("d{i}"), &format!("s{i}"), "Bob", "status");
        event.priority = Some(Priority::P4);
        let delivery = PendingDelivery::new(event, 3, now);
        let report = sched.requeue(InjectionBlock::for_delivery(&delivery));
        assert!(report.rejected.is_empty());
        dropped.extend(
            report
                .dropped
                .into_iter()
                .flat_map(|b| b.delivery_ids),
        );
    }

    assert_eq!(dropped.len(), 50);
    let expected: Vec<String> = (0..50).map(|i| format!("d{i}")).collect();
    assert_eq!(dropped, expected);
    assert_eq!(sched.queued_len(), 200);
}

#[test]
fn p1_survives_p4_flood() {
    let mut sched = scheduler();
    let now = Instant::now();

    let mut sys = send("sys1", "system", "Bob", "shutdown");
    sys.priority = Some(Priority::P1);
    sched.requeue(InjectionBlock::for_delivery(&PendingDelivery::new(
        sys, 3, now,
    )));

    for i in 0..400 {
        let mut event = send(&format!("d{i}"), &format!("s{i}"), "Bob", "noise");
        event.priority = Some(Priority::P4);
        sched.requeue(InjectionBlock::for_delivery(&PendingDelivery::new(
            event, 3, now,
        )));
    }

    let first = sched.pop_ready(now, true).unwrap();
    assert_eq!(first.delivery_ids, vec!["sys1"]);
}

/// Coalesced members resolve together: one echo match acks every id the
/// block carried, in arrival order.
#[test]
fn coalesced_block_acks_every_member() {
    let mut tracker = DeliveryTracker::new(VerifyConfig::default());
    let mut sched = scheduler();
    let mut window = EchoWindow::new(64 * 1024);
    let t0 = Instant::now();

    let first = tracker
        .admit(send("m1", "Alice", "#general", "deploy is done"), t0)
        .unwrap();
    sched.offer(&first, t0);
    tracker.mark_queued(std::slice::from_ref(&first.id));

    let second = tracker
        .admit(
            send("m2", "Alice", "#general", "tests are green"),
            t0 + Duration::from_millis(200),
        )
        .unwrap();
    sched.offer(&second, t0 + Duration::from_millis(200));
    tracker.mark_queued(std::slice::from_ref(&second.id));

    sched.flush_due(t0 + Duration::from_millis(800));
    let block = sched.pop_ready(t0 + Duration::from_millis(800), true).unwrap();
    assert_eq!(block.delivery_ids, vec!["m1", "m2"]);

    let probe = EchoProbe::for_block(&block, &window);
    tracker.mark_injected(&block, probe, t0 + Duration::from_millis(800));
    window.push(&block.payload());

    let actions = tracker.scan_output(&window, t0 + Duration::from_millis(900));
    assert_eq!(actions.len(), 1);
    match &actions[0] {
        TrackerAction::Resolved(res) => {
            assert_eq!(res.delivery_ids, vec!["m1", "m2"]);
        }
        other => panic!("expected Resolved, got {other:?}"),
    }
}

/// Random orderings of admit/inject/echo/ack/timeout events: every
/// admitted delivery sees exactly one terminal outcome, and resolutions
/// never repeat.
#[test]
fn random_event_orderings_respect_lifecycle() {
    for seed in 0..40u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tracker = DeliveryTracker::new(VerifyConfig::default());
        let mut window = EchoWindow::new(64 * 1024);
        let mut now = Instant::now();

        let mut admitted: Vec<String> = Vec::new();
        let mut queued: Vec<PendingDelivery> = Vec::new();
        let mut injected: Vec<InjectionBlock> = Vec::new();
        let mut terminals: HashMap<String, usize> = HashMap::new();
        let mut next_id = 0usize;

        let record = |terminals: &mut HashMap<String, usize>, action: &TrackerAction| {
            let ids = match action {
                TrackerAction::Resolved(res) => &res.delivery_ids,
                TrackerAction::Failed { delivery_ids, .. } => delivery_ids,
                TrackerAction::Requeued { delivery_ids } => delivery_ids,
                TrackerAction::Retry { .. } => return,
            };
            for id in ids {
                *terminals.entry(id.clone()).or_default() += 1;
            }
        };

        for _ in 0..80 {
            match rng.gen_range(0..6) {
                0 => {
                    let id = format!("seed{seed}-d{next_id}");
                    next_id += 1;
                    if let Ok(delivery) =
                        tracker.admit(send(&id, "Alice", "Bob", "try this one"), now)
                    {
                        tracker.mark_queued(std::slice::from_ref(&delivery.id));
                        admitted.push(id);
                        queued.push(delivery);
                    }
                }
                1 => {
                    if let Some(delivery) = queued.pop() {
                        let block = InjectionBlock::for_delivery(&delivery);
                        let probe = EchoProbe::for_block(&block, &window);
                        tracker.mark_injected(&block, probe, now);
                        injected.push(block);
                    }
                }
                2 => {
                    if !injected.is_empty() {
                        let idx = rng.gen_range(0..injected.len());
                        window.push(&injected[idx].payload());
                        for action in tracker.scan_output(&window, now) {
                            record(&mut terminals, &action);
                        }
                    }
                }
                3 => {
                    if !injected.is_empty() {
                        let idx = rng.gen_range(0..injected.len());
                        let id = injected[idx].delivery_ids[0].clone();
                        if let Some(action) = tracker.signal_ack(&id, SignalKind::FileAck, now) {
                            record(&mut terminals, &action);
                        }
                    }
                }
                4 => {
                    now += Duration::from_millis(rng.gen_range(0..7000));
                    for action in tracker.tick(now) {
                        if let TrackerAction::Retry { block } = action {
                            // Immediate re-queue and re-injection, as the
                            // session does for local retries.
                            tracker.mark_queued(&block.delivery_ids);
                            let probe = EchoProbe::for_block(&block, &window);
                            tracker.mark_injected(&block, probe, now);
                            injected.push(block);
                        } else {
                            record(&mut terminals, &action);
                        }
                    }
                }
                _ => {
                    now += Duration::from_millis(rng.gen_range(0..500));
                }
            }
        }

        for action in tracker.drain_all(false) {
            record(&mut terminals, &action);
        }

        for id in &admitted {
            assert_eq!(
                terminals.get(id).copied().unwrap_or(0),
                1,
                "seed {seed}: delivery {id} saw {} terminal outcomes",
                terminals.get(id).copied().unwrap_or(0)
            );
        }
    }
}

/// A human keystroke holds P2-P4 but a P1 block still goes out at once.
#[test]
fn cooldown_holds_gated_tiers_only() {
    let human = Arc::new(HumanActivityState::new());
    let mut sched = InjectionScheduler::new(SchedulerConfig::default(), human.clone());
    let t0 = Instant::now();

    let direct = PendingDelivery::new(send("d1", "Alice", "Bob", "hello"), 3, t0);
    sched.offer(&direct, t0);
    sched.flush_due(t0 + Duration::from_millis(600));

    human.record_keystroke(t0 + Duration::from_millis(700));
    assert!(sched.pop_ready(t0 + Duration::from_millis(800), true).is_none());

    let mut sys = send("s1", "system", "Bob", "ack");
    sys.priority = Some(Priority::P1);
    let urgent = PendingDelivery::new(sys, 3, t0 + Duration::from_millis(900));
    sched.offer(&urgent, t0 + Duration::from_millis(900));
    let popped = sched
        .pop_ready(t0 + Duration::from_millis(950), false)
        .unwrap();
    assert_eq!(popped.delivery_ids, vec!["s1"]);

    // Cooldown expiry releases the held block.
    let popped = sched
        .pop_ready(t0 + Duration::from_millis(3701), true)
        .unwrap();
    assert_eq!(popped.delivery_ids, vec!["d1"]);
}
