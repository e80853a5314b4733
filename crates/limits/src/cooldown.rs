//! Temporarily skip queues whose jobs keep getting throttled.
//!
//! A queue whose head is saturated would otherwise be popped and requeued in
//! a tight loop while other queues starve. After `threshold` consecutive
//! throttled pops the queue is excluded from polling for `period`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use throttlekit_core::{Clock, QueueName, ThrottleConfig};
use tracing::info;

use crate::expiring::ExpiringSet;

/// Per-queue throttle streaks plus the set of queues cooling down.
#[derive(Debug)]
pub struct Cooldown {
    threshold: u32,
    streaks: Mutex<HashMap<QueueName, u32>>,
    cooling: ExpiringSet<QueueName>,
}

impl Cooldown {
    pub fn new(period: Duration, threshold: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            streaks: Mutex::new(HashMap::new()),
            cooling: ExpiringSet::new(period, clock),
        }
    }

    /// `None` when the configuration disables cooldown.
    pub fn from_config(config: &ThrottleConfig, clock: Arc<dyn Clock>) -> Option<Self> {
        let period = config.cooldown_period?;
        Some(Self::new(period, config.cooldown_threshold, clock))
    }

    pub fn period(&self) -> Duration {
        self.cooling.ttl()
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count a throttled pop from `queue`.
    pub fn notify_throttled(&self, queue: &QueueName) {
        let mut streaks = self.streaks();
        let streak = streaks.entry(queue.clone()).or_insert(0);
        *streak += 1;
        if *streak < self.threshold {
            return;
        }

        streaks.remove(queue);
        drop(streaks);
        self.cooling.add(queue.clone());
        info!(queue = %queue, period_ms = self.period().as_millis() as u64, "queue cooling down");
    }

    /// An admitted pop ends the streak.
    pub fn notify_admitted(&self, queue: &QueueName) {
        self.streaks().remove(queue);
    }

    /// Queues currently excluded from polling.
    pub fn queues(&self) -> Vec<QueueName> {
        self.cooling.snapshot()
    }

    pub fn is_cooling(&self, queue: &QueueName) -> bool {
        self.cooling.contains(queue)
    }

    fn streaks(&self) -> MutexGuard<'_, HashMap<QueueName, u32>> {
        self.streaks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use throttlekit_core::ManualClock;

    fn cooldown(period_secs: u64, threshold: u32) -> (Cooldown, ManualClock) {
        let clock = ManualClock::default();
        (
            Cooldown::new(Duration::from_secs(period_secs), threshold, Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn threshold_one_cools_immediately_and_recovers() {
        let (cooldown, clock) = cooldown(2, 1);
        let mail = QueueName::from("mail");

        cooldown.notify_throttled(&mail);
        assert_eq!(cooldown.queues(), vec![mail.clone()]);

        clock.advance(Duration::from_secs(2));
        assert!(cooldown.queues().is_empty());
    }

    #[test]
    fn admitted_pop_resets_streak() {
        let (cooldown, _) = cooldown(10, 3);
        let mail = QueueName::from("mail");

        cooldown.notify_throttled(&mail);
        cooldown.notify_throttled(&mail);
        cooldown.notify_admitted(&mail);
        cooldown.notify_throttled(&mail);
        cooldown.notify_throttled(&mail);
        assert!(!cooldown.is_cooling(&mail));

        cooldown.notify_throttled(&mail);
        assert!(cooldown.is_cooling(&mail));
    }

    #[test]
    fn queues_are_tracked_independently() {
        let (cooldown, _) = cooldown(10, 2);
        let mail = QueueName::from("mail");
        let bulk = QueueName::from("bulk");

        cooldown.notify_throttled(&mail);
        cooldown.notify_throttled(&bulk);
        cooldown.notify_throttled(&mail);

        assert_eq!(cooldown.queues(), vec![mail]);
    }

    #[test]
    fn disabled_by_config() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let off = ThrottleConfig::default().with_cooldown(None, 5);
        assert!(Cooldown::from_config(&off, Arc::clone(&clock)).is_none());

        let on = ThrottleConfig::default().with_cooldown(Some(Duration::from_secs(3)), 5);
        let cooldown = Cooldown::from_config(&on, clock).unwrap();
        assert_eq!(cooldown.period(), Duration::from_secs(3));
        assert_eq!(cooldown.threshold(), 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: a queue is cooling exactly when some run of consecutive
        /// throttled notifications reached the threshold.
        #[test]
        fn cooling_matches_streak_model(
            threshold in 1u32..6,
            outcomes in prop::collection::vec(any::<bool>(), 0..40),
        ) {
            let (cooldown, _) = cooldown(60, threshold);
            let queue = QueueName::from("q");
            let mut streak = 0u32;
            let mut cooled = false;

            for throttled in outcomes {
                if throttled {
                    cooldown.notify_throttled(&queue);
                    streak += 1;
                    if streak == threshold {
                        cooled = true;
                        streak = 0;
                    }
                } else {
                    cooldown.notify_admitted(&queue);
                    streak = 0;
                }
                prop_assert_eq!(cooldown.is_cooling(&queue), cooled);
            }
        }
    }
}
