//! Stress tests for the bounded priority queue.
//! Run with: cargo test --test stress_queue -- --ignored

use courier::queue::{BoundedPriorityQueue, Prioritized};
use courier::types::Priority;

#[derive(Debug, Clone)]
struct Msg {
    id: usize,
    priority: Priority,
    bytes: usize,
}

impl Prioritized for Msg {
    fn priority(&self) -> Priority {
        self.priority
    }

    fn cost(&self) -> usize {
        self.bytes
    }
}

fn msg(id: usize, priority: Priority) -> Msg {
    Msg {
        id,
        priority,
        bytes: 64,
    }
}

fn cycled_priority(i: usize) -> Priority {
    match i % 5 {
        0 => Priority::P0,
        1 => Priority::P1,
        2 => Priority::P2,
        3 => Priority::P3,
        _ => Priority::P4,
    }
}

#[test]
#[ignore]
fn ten_thousand_items_pop_in_priority_order() {
    let max = 5_000;
    let mut queue = BoundedPriorityQueue::<Msg>::new(max, usize::MAX);

    for i in 0..10_000 {
        let _ = queue.push_with_overflow(msg(i, cycled_priority(i)));
        assert!(queue.len() <= max, "queue exceeded max at push {i}");
    }

    let mut prev = 0u8;
    while let Some(item) = queue.pop() {
        let p = item.priority.as_u8();
        assert!(p >= prev, "priority order violation: {p} after {prev}");
        prev = prev.max(p);
    }
}

#[test]
#[ignore]
fn overflow_never_drops_p1_under_sustained_pressure() {
    let max = 100;
    let mut queue = BoundedPriorityQueue::<Msg>::new(max, usize::MAX);
    let mut p1_admitted = 0u64;

    for i in 0..50_000 {
        let priority = if i % 7 == 0 {
            Priority::P1
        } else {
            cycled_priority(i)
        };
        let admitted = queue.push_with_overflow(msg(i, priority)).is_ok();
        if admitted && priority == Priority::P1 {
            p1_admitted += 1;
        }
        assert!(queue.len() <= max);
    }

    let mut p1_found = 0u64;
    while let Some(item) = queue.pop() {
        if item.priority == Priority::P1 {
            p1_found += 1;
        }
    }
    // Every admitted P1 that was not popped mid-run must still be present.
    // Nothing pops mid-run here, so the tail of admissions is bounded by
    // the queue size and all of them must be P0/P1 by the end.
    assert!(p1_found > 0);
    assert!(p1_found <= p1_admitted);
    assert_eq!(queue.len(), 0);
}

#[test]
#[ignore]
fn byte_budget_holds_under_large_bodies() {
    let mut queue = BoundedPriorityQueue::<Msg>::new(usize::MAX, 10_000);
    for i in 0..1_000 {
        let _ = queue.push_with_overflow(Msg {
            id: i,
            priority: Priority::P3,
            bytes: 512,
        });
        assert!(queue.byte_size() <= 10_000);
    }
}

#[test]
fn fifo_order_survives_heavy_churn() {
    let mut queue = BoundedPriorityQueue::<Msg>::new(64, usize::MAX);
    let mut next_expected = None::<usize>;

    for i in 0..1_000 {
        let _ = queue.push_with_overflow(msg(i, Priority::P3));
        if i % 3 == 0 {
            if let Some(item) = queue.pop() {
                if let Some(prev) = next_expected {
                    assert!(item.id > prev, "FIFO violated: {} after {}", item.id, prev);
                }
                next_expected = Some(item.id);
            }
        }
    }
}
