//! Dispatch ordering over ready batches.
//!
//! Which sealed batch goes to a freed worker first is a policy decision, so
//! it is kept behind a comparator trait rather than hard-coded.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::batch::Batch;

/// Total order over ready batches; `Less` means dispatched first.
pub trait DispatchPolicy: Send + Sync {
    fn compare(&self, a: &Batch, b: &Batch, now: Instant) -> Ordering;
}

/// Default policy: strict priority precedence with starvation escalation.
///
/// Batches that have waited past `max_wait` jump ahead of everything fresher,
/// oldest first; otherwise higher priority wins, then earlier open time.
/// This bounds the worst-case wait of a low-priority bucket under sustained
/// high-priority traffic.
pub struct EscalatingPriority {
    max_wait: Duration,
}

impl EscalatingPriority {
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }
}

impl DispatchPolicy for EscalatingPriority {
    fn compare(&self, a: &Batch, b: &Batch, now: Instant) -> Ordering {
        let a_overdue = a.age(now) >= self.max_wait;
        let b_overdue = b.age(now) >= self.max_wait;

        b_overdue
            .cmp(&a_overdue)
            .then(b.priority.cmp(&a.priority))
            .then(a.opened_at.cmp(&b.opened_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use uuid::Uuid;
    use vision_serve_common::Priority;

    fn batch_with(priority: Priority, opened_ago: Duration, now: Instant) -> Batch {
        Batch {
            id: Uuid::new_v4(),
            model_id: "resnet50".to_string(),
            priority,
            requests: vec![],
            opened_at: now - opened_ago,
            sealed_at: now,
        }
    }

    #[rstest]
    #[case(Priority::High, Priority::Normal)]
    #[case(Priority::High, Priority::Low)]
    #[case(Priority::Normal, Priority::Low)]
    fn test_higher_priority_first(#[case] higher: Priority, #[case] lower: Priority) {
        let now = Instant::now();
        let policy = EscalatingPriority::new(Duration::from_millis(100));

        let a = batch_with(higher, Duration::from_millis(1), now);
        let b = batch_with(lower, Duration::from_millis(1), now);

        assert_eq!(policy.compare(&a, &b, now), Ordering::Less);
        assert_eq!(policy.compare(&b, &a, now), Ordering::Greater);
    }

    #[test]
    fn test_overdue_low_beats_fresh_high() {
        let now = Instant::now();
        let policy = EscalatingPriority::new(Duration::from_millis(100));

        let overdue_low = batch_with(Priority::Low, Duration::from_millis(150), now);
        let fresh_high = batch_with(Priority::High, Duration::from_millis(5), now);

        assert_eq!(policy.compare(&overdue_low, &fresh_high, now), Ordering::Less);
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let now = Instant::now();
        let policy = EscalatingPriority::new(Duration::from_millis(100));

        let older = batch_with(Priority::Normal, Duration::from_millis(40), now);
        let newer = batch_with(Priority::Normal, Duration::from_millis(10), now);

        assert_eq!(policy.compare(&older, &newer, now), Ordering::Less);
    }

    #[test]
    fn test_priority_breaks_overdue_tie() {
        let now = Instant::now();
        let policy = EscalatingPriority::new(Duration::from_millis(100));

        let overdue_high = batch_with(Priority::High, Duration::from_millis(120), now);
        let overdue_low = batch_with(Priority::Low, Duration::from_millis(200), now);

        assert_eq!(policy.compare(&overdue_high, &overdue_low, now), Ordering::Less);
    }
}
