//! Integration tests for the throttled fetch pipeline.
//!
//! Tests: queue pop → throttling decision → requeue / yield → acknowledge
//!
//! Verifies:
//! - Throttled jobs go back to the right queue (tail, schedule or retarget)
//! - Cooldown and paused queues are left out of polling
//! - Abandoned and failed jobs are never lost

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use throttlekit_core::{
        Clock, Limit, ManualClock, Message, QueueName, RequeueOptions, StoreError, StoreResult,
        ThrottleConfig, ThrottleError,
    };
    use throttlekit_limits::{ConcurrencyOptions, StrategyOptions, ThresholdOptions};
    use throttlekit_store::{InMemoryStore, ThrottleStore};

    use crate::fetch::{FetchError, ThrottledFetch};
    use crate::queue::{InMemoryQueue, QueueBackend};
    use crate::throttling::Throttling;

    struct Harness {
        queue: Arc<InMemoryQueue>,
        throttling: Arc<Throttling>,
        clock: ManualClock,
        fetch: ThrottledFetch,
    }

    fn setup(config: ThrottleConfig, queues: &[&str]) -> Harness {
        setup_with_store(Arc::new(InMemoryStore::new()), config, queues)
    }

    fn setup_with_store(
        store: Arc<dyn ThrottleStore>,
        config: ThrottleConfig,
        queues: &[&str],
    ) -> Harness {
        throttlekit_observability::init_for_tests();

        let clock = ManualClock::default();
        let queue = Arc::new(InMemoryQueue::new());
        let throttling = Arc::new(
            Throttling::new(
                store,
                Arc::new(clock.clone()),
                config.with_fetch_timeout(Duration::from_millis(5)),
            )
            .unwrap()
            .with_max_jitter(0.0),
        );
        let fetch = ThrottledFetch::new(
            queue.clone(),
            Arc::clone(&throttling),
            queues.iter().map(|q| QueueName::from(*q)),
        );

        Harness {
            queue,
            throttling,
            clock,
            fetch,
        }
    }

    fn q(name: &str) -> QueueName {
        QueueName::from(name)
    }

    fn payload(class: &str, jid: &str, queue: &str) -> String {
        serde_json::json!({ "class": class, "jid": jid, "args": [], "queue": queue }).to_string()
    }

    fn jid_of(raw: &str) -> String {
        Message::parse(raw).unwrap().job_id().to_string()
    }

    fn limit_concurrency(h: &Harness, class: &str, limit: u64) {
        h.throttling
            .registry()
            .add(class, StrategyOptions::new().concurrency(ConcurrencyOptions::new(limit)))
            .unwrap();
    }

    #[test]
    fn throttled_job_goes_to_the_tail_and_runs_after_acknowledge() {
        let h = setup(ThrottleConfig::default(), &["default"]);
        limit_concurrency(&h, "ReportJob", 1);

        h.queue.push_back(&q("default"), &payload("ReportJob", "a", "default")).unwrap();
        h.queue.push_back(&q("default"), &payload("ReportJob", "b", "default")).unwrap();
        h.queue.push_back(&q("default"), &payload("Other", "c", "default")).unwrap();

        let first = h.fetch.retrieve_work().unwrap().expect("a is admitted");
        assert_eq!(first.message().unwrap().job_id().as_str(), "a");

        assert!(h.fetch.retrieve_work().unwrap().is_none());
        let waiting: Vec<String> = h
            .queue
            .contents(&q("default"))
            .unwrap()
            .iter()
            .map(|p| jid_of(p))
            .collect();
        assert_eq!(waiting, ["c", "b"]);

        let other = h.fetch.retrieve_work().unwrap().expect("unthrottled class");
        assert_eq!(other.message().unwrap().job_id().as_str(), "c");
        other.acknowledge().unwrap();

        first.acknowledge().unwrap();
        let second = h.fetch.retrieve_work().unwrap().expect("slot was released");
        assert_eq!(second.message().unwrap().job_id().as_str(), "b");
        second.acknowledge().unwrap();
    }

    #[test]
    fn schedule_mode_defers_by_the_wait_estimate() {
        let h = setup(ThrottleConfig::default(), &["default"]);
        h.throttling
            .registry()
            .add(
                "Mailer",
                StrategyOptions::new()
                    .threshold(ThresholdOptions::new(1, Duration::from_secs(60)))
                    .requeue(RequeueOptions::schedule()),
            )
            .unwrap();
        let now = h.clock.now();

        h.queue.push_back(&q("default"), &payload("Mailer", "a", "default")).unwrap();
        h.queue.push_back(&q("default"), &payload("Mailer", "b", "default")).unwrap();

        h.fetch.retrieve_work().unwrap().expect("a is admitted");
        assert!(h.fetch.retrieve_work().unwrap().is_none());

        assert_eq!(h.queue.len(&q("default")).unwrap(), 0);
        let scheduled = h.queue.scheduled().unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].queue, q("default"));
        assert_eq!(jid_of(&scheduled[0].payload), "b");
        assert_eq!(scheduled[0].at, now + 60.0);

        h.clock.advance(Duration::from_secs(59));
        h.queue.promote_due(h.clock.now()).unwrap();
        assert_eq!(h.queue.len(&q("default")).unwrap(), 0);

        h.clock.advance(Duration::from_secs(1));
        h.queue.promote_due(h.clock.now()).unwrap();
        let unit = h.fetch.retrieve_work().unwrap().expect("window rolled");
        assert_eq!(unit.message().unwrap().job_id().as_str(), "b");
    }

    /// Delegates to an in-memory store; bucket reads fail once `broken` is set.
    struct FlakyStore {
        inner: InMemoryStore,
        broken: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                broken: AtomicBool::new(false),
            }
        }

        fn break_reads(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    impl ThrottleStore for FlakyStore {
        fn concurrency_acquire(
            &self,
            key: &str,
            backlog_key: &str,
            job_id: &str,
            limit: u64,
            ttl: f64,
            now: f64,
        ) -> StoreResult<bool> {
            self.inner
                .concurrency_acquire(key, backlog_key, job_id, limit, ttl, now)
        }

        fn concurrency_release(&self, key: &str, backlog_key: &str, job_id: &str) -> StoreResult<()> {
            self.inner.concurrency_release(key, backlog_key, job_id)
        }

        fn concurrency_backlog_position(
            &self,
            backlog_key: &str,
            job_id: &str,
            now: f64,
        ) -> StoreResult<u64> {
            self.inner.concurrency_backlog_position(backlog_key, job_id, now)
        }

        fn concurrency_count(&self, key: &str, now: f64) -> StoreResult<u64> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::connection("reset by peer"));
            }
            self.inner.concurrency_count(key, now)
        }

        fn concurrency_oldest_expiry(&self, key: &str, now: f64) -> StoreResult<Option<f64>> {
            self.inner.concurrency_oldest_expiry(key, now)
        }

        fn threshold_acquire(&self, key: &str, limit: u64, period: f64, now: f64) -> StoreResult<bool> {
            self.inner.threshold_acquire(key, limit, period, now)
        }

        fn threshold_count(&self, key: &str, now: f64) -> StoreResult<u64> {
            self.inner.threshold_count(key, now)
        }

        fn threshold_oldest(&self, key: &str, now: f64) -> StoreResult<Option<f64>> {
            self.inner.threshold_oldest(key, now)
        }

        fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key)
        }

        fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
            self.inner.set_add(key, member)
        }

        fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
            self.inner.set_remove(key, member)
        }

        fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
            self.inner.set_members(key)
        }
    }

    #[test]
    fn failed_requeue_returns_the_job_to_the_head() {
        let store = Arc::new(FlakyStore::new());
        let h = setup_with_store(store.clone(), ThrottleConfig::default(), &["default"]);
        h.throttling
            .registry()
            .add(
                "ReportJob",
                StrategyOptions::new()
                    .concurrency(ConcurrencyOptions::new(1))
                    .requeue(RequeueOptions::schedule()),
            )
            .unwrap();

        h.queue.push_back(&q("default"), &payload("ReportJob", "a", "default")).unwrap();
        h.queue.push_back(&q("default"), &payload("ReportJob", "b", "default")).unwrap();

        let _running = h.fetch.retrieve_work().unwrap().expect("a is admitted");
        store.break_reads();

        let err = h.fetch.retrieve_work().unwrap_err();
        assert!(matches!(
            err,
            FetchError::Throttle(ThrottleError::Store(StoreError::Connection(_)))
        ));

        let waiting = h.queue.contents(&q("default")).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(jid_of(&waiting[0]), "b");
        assert!(h.queue.scheduled().unwrap().is_empty());
    }

    #[test]
    fn requeue_to_another_queue_rewrites_the_payload() {
        let h = setup(ThrottleConfig::default(), &["default", "slow"]);
        h.throttling
            .registry()
            .add(
                "ReportJob",
                StrategyOptions::new()
                    .concurrency(ConcurrencyOptions::new(1))
                    .requeue(RequeueOptions::enqueue().to("slow")),
            )
            .unwrap();

        h.queue.push_back(&q("default"), &payload("ReportJob", "a", "default")).unwrap();
        h.queue.push_back(&q("default"), &payload("ReportJob", "b", "default")).unwrap();

        let _running = h.fetch.retrieve_work().unwrap().expect("a is admitted");
        assert!(h.fetch.retrieve_work().unwrap().is_none());

        let moved = h.queue.contents(&q("slow")).unwrap();
        assert_eq!(moved.len(), 1);
        let message = Message::parse(&moved[0]).unwrap();
        assert_eq!(message.job_id().as_str(), "b");
        assert_eq!(message.queue(), Some(&q("slow")));
    }

    #[test]
    fn saturated_queue_cools_down_then_returns() {
        let config = ThrottleConfig::default().with_cooldown(Some(Duration::from_secs(2)), 1);
        let h = setup(config, &["busy", "other"]);
        limit_concurrency(&h, "ReportJob", 1);

        h.queue.push_back(&q("busy"), &payload("ReportJob", "a", "busy")).unwrap();
        h.queue.push_back(&q("busy"), &payload("ReportJob", "b", "busy")).unwrap();

        let _running = h.fetch.retrieve_work().unwrap().expect("a is admitted");
        assert!(h.fetch.retrieve_work().unwrap().is_none());

        assert_eq!(h.fetch.candidate_queues().unwrap(), [q("other")]);

        h.clock.advance(Duration::from_secs(2));
        assert_eq!(h.fetch.candidate_queues().unwrap(), [q("busy"), q("other")]);
    }

    #[test]
    fn paused_queues_are_not_polled() {
        let h = setup(ThrottleConfig::default(), &["bulk"]);
        h.queue.push_back(&q("bulk"), &payload("Other", "a", "bulk")).unwrap();

        h.throttling.paused().pause(&q("bulk")).unwrap();
        assert!(h.fetch.candidate_queues().unwrap().is_empty());
        assert!(h.fetch.retrieve_work().unwrap().is_none());
        assert_eq!(h.queue.len(&q("bulk")).unwrap(), 1);

        h.throttling.paused().resume(&q("bulk")).unwrap();
        assert!(h.fetch.retrieve_work().unwrap().is_some());
    }

    #[test]
    fn abandoned_work_returns_to_the_head_and_frees_its_slot() {
        let h = setup(ThrottleConfig::default(), &["default"]);
        limit_concurrency(&h, "ReportJob", 1);

        h.queue.push_back(&q("default"), &payload("ReportJob", "a", "default")).unwrap();
        h.queue.push_back(&q("default"), &payload("Other", "c", "default")).unwrap();

        let unit = h.fetch.retrieve_work().unwrap().expect("a is admitted");
        unit.requeue().unwrap();

        let order: Vec<String> = h
            .queue
            .contents(&q("default"))
            .unwrap()
            .iter()
            .map(|p| jid_of(p))
            .collect();
        assert_eq!(order, ["a", "c"]);

        let rule = h.throttling.registry().get("ReportJob").unwrap();
        let count = rule.strategies()[0].concurrency().unwrap().count(&[]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn unreadable_payloads_are_yielded_unthrottled() {
        let h = setup(ThrottleConfig::default(), &["default"]);
        h.queue.push_back(&q("default"), "{not json").unwrap();

        let unit = h.fetch.retrieve_work().unwrap().expect("yielded as is");
        assert!(unit.message().is_none());
        assert_eq!(unit.payload(), "{not json");
        unit.acknowledge().unwrap();
    }

    #[test]
    fn failing_limit_function_keeps_the_job() {
        let h = setup(ThrottleConfig::default(), &["default"]);
        h.throttling
            .registry()
            .add(
                "TenantJob",
                StrategyOptions::new().concurrency(ConcurrencyOptions::new(Limit::dynamic(|_| {
                    Err(anyhow::anyhow!("tenant lookup failed"))
                }))),
            )
            .unwrap();

        h.queue.push_back(&q("default"), &payload("TenantJob", "a", "default")).unwrap();

        let err = h.fetch.retrieve_work().unwrap_err();
        assert!(matches!(
            err,
            FetchError::Throttle(ThrottleError::KeyFunction { .. })
        ));
        assert_eq!(h.queue.len(&q("default")).unwrap(), 1);
    }
}
