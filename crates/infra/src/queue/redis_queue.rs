//! Redis job queue in the conventional layout.
//!
//! - `queue:<name>`: list, producers `LPUSH`, workers `BRPOP` (so the right
//!   end is the head)
//! - `queues`: set of known queue names
//! - `schedule`: sorted set of payloads scored by their due time
//!
//! A scheduled payload carries its target queue in its `queue` field; the
//! host's scheduler moves it to `queue:<name>` when due.

use std::sync::Arc;
use std::time::Duration;

use redis::{Client, Connection, RedisError};
use tracing::{debug, instrument};

use throttlekit_core::{QueueName, message};

use super::{PoppedJob, QueueBackend, QueueError, QueueResult};

const QUEUE_PREFIX: &str = "queue:";
const QUEUES_KEY: &str = "queues";
const SCHEDULE_KEY: &str = "schedule";

/// Smallest blocking timeout sent to the server; `0` would block forever.
const MIN_BLOCK_SECS: f64 = 0.01;

fn command_error(op: &str, err: RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() {
        QueueError::Connection(err.to_string())
    } else {
        QueueError::Command(format!("{op} failed: {err}"))
    }
}

fn queue_key(queue: &QueueName) -> String {
    format!("{QUEUE_PREFIX}{queue}")
}

#[derive(Debug, Clone)]
pub struct RedisQueue {
    client: Arc<Client>,
}

impl RedisQueue {
    pub fn new(redis_url: impl AsRef<str>) -> QueueResult<Self> {
        let client = Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> QueueResult<Connection> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

impl QueueBackend for RedisQueue {
    #[instrument(skip(self), err)]
    fn pop(&self, queues: &[QueueName], timeout: Duration) -> QueueResult<Option<PoppedJob>> {
        if queues.is_empty() {
            return Ok(None);
        }

        let mut conn = self.connection()?;
        let keys: Vec<String> = queues.iter().map(queue_key).collect();
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&keys)
            .arg(timeout.as_secs_f64().max(MIN_BLOCK_SECS))
            .query(&mut conn)
            .map_err(|e| command_error("BRPOP", e))?;

        Ok(reply.map(|(key, payload)| {
            let name = key.strip_prefix(QUEUE_PREFIX).unwrap_or(&key);
            debug!(queue = %name, "popped job");
            PoppedJob {
                queue: QueueName::new(name),
                payload,
            }
        }))
    }

    #[instrument(skip(self, payload), err)]
    fn push_back(&self, queue: &QueueName, payload: &str) -> QueueResult<()> {
        let mut conn = self.connection()?;
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(QUEUES_KEY)
            .arg(queue.as_str())
            .ignore()
            .cmd("LPUSH")
            .arg(queue_key(queue))
            .arg(payload)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| command_error("LPUSH", e))
    }

    #[instrument(skip(self, payload), err)]
    fn push_front(&self, queue: &QueueName, payload: &str) -> QueueResult<()> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(queue_key(queue))
            .arg(payload)
            .query(&mut conn)
            .map_err(|e| command_error("RPUSH", e))?;
        Ok(())
    }

    #[instrument(skip(self, payload), err)]
    fn schedule(&self, queue: &QueueName, payload: &str, at: f64) -> QueueResult<()> {
        let payload = message::retarget(payload, queue)
            .map_err(|e| QueueError::Command(format!("cannot schedule payload: {e}")))?;

        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("ZADD")
            .arg(SCHEDULE_KEY)
            .arg(at)
            .arg(payload)
            .query(&mut conn)
            .map_err(|e| command_error("ZADD", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_follow_layout() {
        assert_eq!(queue_key(&QueueName::from("mailers")), "queue:mailers");
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        assert!(matches!(
            RedisQueue::new("not a url"),
            Err(QueueError::Connection(_))
        ));
    }
}
