//! In-memory job queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use throttlekit_core::QueueName;

use super::{PoppedJob, QueueBackend, QueueError, QueueResult};

/// A job waiting in the schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub at: f64,
    pub queue: QueueName,
    pub payload: String,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<QueueName, VecDeque<String>>,
    scheduled: Vec<ScheduledJob>,
}

/// In-memory queue with blocking pop.
///
/// - Queues are FIFO; `pop` takes from the head
/// - Scheduled jobs stay aside until [`InMemoryQueue::promote_due`]
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    ready: Condvar,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads of `queue`, head first.
    pub fn contents(&self, queue: &QueueName) -> QueueResult<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn len(&self, queue: &QueueName) -> QueueResult<usize> {
        Ok(self.lock()?.queues.get(queue).map_or(0, VecDeque::len))
    }

    /// Scheduled jobs, soonest first.
    pub fn scheduled(&self) -> QueueResult<Vec<ScheduledJob>> {
        Ok(self.lock()?.scheduled.clone())
    }

    /// Move every scheduled job due at `now` to the tail of its queue.
    pub fn promote_due(&self, now: f64) -> QueueResult<usize> {
        let mut state = self.lock()?;
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition(|job| job.at <= now);
        state.scheduled = later;

        let promoted = due.len();
        for job in due {
            state.queues.entry(job.queue).or_default().push_back(job.payload);
        }
        drop(state);

        if promoted > 0 {
            self.ready.notify_all();
        }
        Ok(promoted)
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    fn push(&self, queue: &QueueName, payload: &str, front: bool) -> QueueResult<()> {
        let mut state = self.lock()?;
        let entries = state.queues.entry(queue.clone()).or_default();
        if front {
            entries.push_front(payload.to_string());
        } else {
            entries.push_back(payload.to_string());
        }
        drop(state);
        self.ready.notify_all();
        Ok(())
    }
}

impl QueueBackend for InMemoryQueue {
    fn pop(&self, queues: &[QueueName], timeout: Duration) -> QueueResult<Option<PoppedJob>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;

        loop {
            for queue in queues {
                if let Some(payload) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                    return Ok(Some(PoppedJob {
                        queue: queue.clone(),
                        payload,
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| QueueError::Poisoned)?;
            state = guard;
        }
    }

    fn push_back(&self, queue: &QueueName, payload: &str) -> QueueResult<()> {
        self.push(queue, payload, false)
    }

    fn push_front(&self, queue: &QueueName, payload: &str) -> QueueResult<()> {
        self.push(queue, payload, true)
    }

    fn schedule(&self, queue: &QueueName, payload: &str, at: f64) -> QueueResult<()> {
        let mut state = self.lock()?;
        let idx = state.scheduled.partition_point(|job| job.at <= at);
        state.scheduled.insert(
            idx,
            ScheduledJob {
                at,
                queue: queue.clone(),
                payload: payload.to_string(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn q(name: &str) -> QueueName {
        QueueName::from(name)
    }

    #[test]
    fn pops_in_queue_priority_order() {
        let queue = InMemoryQueue::new();
        queue.push_back(&q("low"), "l1").unwrap();
        queue.push_back(&q("high"), "h1").unwrap();
        queue.push_back(&q("high"), "h2").unwrap();

        let order = [q("high"), q("low")];
        let popped: Vec<String> = (0..3)
            .map(|_| queue.pop(&order, Duration::ZERO).unwrap().unwrap().payload)
            .collect();

        assert_eq!(popped, ["h1", "h2", "l1"]);
        assert_eq!(queue.pop(&order, Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn push_front_jumps_the_line() {
        let queue = InMemoryQueue::new();
        queue.push_back(&q("default"), "a").unwrap();
        queue.push_front(&q("default"), "b").unwrap();

        assert_eq!(queue.contents(&q("default")).unwrap(), ["b", "a"]);
    }

    #[test]
    fn pop_waits_for_a_push() {
        let queue = Arc::new(InMemoryQueue::new());
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push_back(&q("default"), "late").unwrap();
        });

        let popped = queue.pop(&[q("default")], Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(popped.map(|j| j.payload).as_deref(), Some("late"));
    }

    #[test]
    fn scheduled_jobs_wait_until_promoted() {
        let queue = InMemoryQueue::new();
        queue.schedule(&q("default"), "later", 200.0).unwrap();
        queue.schedule(&q("default"), "sooner", 100.0).unwrap();

        let at: Vec<f64> = queue.scheduled().unwrap().iter().map(|j| j.at).collect();
        assert_eq!(at, [100.0, 200.0]);

        assert_eq!(queue.promote_due(150.0).unwrap(), 1);
        assert_eq!(queue.contents(&q("default")).unwrap(), ["sooner"]);
        assert_eq!(queue.scheduled().unwrap().len(), 1);
    }
}
