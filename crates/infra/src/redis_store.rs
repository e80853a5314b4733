//! Redis-backed throttle store.
//!
//! ## Key layout
//!
//! - `throttled:<name>:concurrency[:<suffix>]`: sorted set, member = job id,
//!   score = expiry timestamp
//! - `throttled:<name>:concurrency[:<suffix>]:backlog`: sorted set of turned
//!   away job ids, score = first rejection + lost-job threshold
//! - `throttled:<name>:threshold[:<suffix>]`: list of start timestamps,
//!   newest first, key TTL = period
//! - `throttled:paused_queues`: plain set
//!
//! Keys arrive fully qualified (namespace prefix already applied by the
//! strategy backend). Both admission checks and the backlog lookup run as one
//! Lua script each. Key expiries are sent in milliseconds (at least 1) so
//! sub-second windows and thresholds behave like the in-memory store.

use std::sync::Arc;

use redis::{Client, Connection, RedisError};
use tracing::instrument;

use throttlekit_core::{StoreError, StoreResult};
use throttlekit_store::ThrottleStore;

use crate::script::ScriptExecutor;

/// Drops expired entries, then admits `jid` unless the bucket is full.
/// A job already in the bucket is re-admitted with a fresh expiry. A
/// throttled job joins the backlog unless already waiting there.
///
/// KEYS = [bucket, backlog]  ARGV = [jid, limit, ttl, now, ttl_ms]
const CONCURRENCY_SCRIPT: &str = r#"
local key = KEYS[1]
local backlog = KEYS[2]
local jid = ARGV[1]
local lmt = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

redis.call("ZREMRANGEBYSCORE", key, "-inf", "(" .. ARGV[4])
redis.call("ZREMRANGEBYSCORE", backlog, "-inf", "(" .. ARGV[4])

if lmt <= redis.call("ZCARD", key) and not redis.call("ZSCORE", key, jid) then
  redis.call("ZADD", backlog, "NX", now + ttl, jid)
  redis.call("PEXPIRE", backlog, ARGV[5])
  return 1
end

redis.call("ZADD", key, now + ttl, jid)
redis.call("PEXPIRE", key, ARGV[5])
redis.call("ZREM", backlog, jid)
return 0
"#;

/// 1-based rank of `jid` among live backlog entries, or the rank it would
/// take by joining now.
///
/// KEYS = [backlog]  ARGV = [jid, now]
const BACKLOG_SCRIPT: &str = r#"
local key = KEYS[1]

redis.call("ZREMRANGEBYSCORE", key, "-inf", "(" .. ARGV[2])

local rank = redis.call("ZRANK", key, ARGV[1])
if rank then
  return rank + 1
end
return redis.call("ZCARD", key) + 1
"#;

/// Throttles when the window holds `limit` starts and the oldest is younger
/// than `period`; otherwise records `now` and trims the window.
///
/// KEYS = [window]  ARGV = [limit, period, now, period_ms]
const THRESHOLD_SCRIPT: &str = r#"
local key = KEYS[1]
local lmt = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

if lmt <= redis.call("LLEN", key) and now - tonumber(redis.call("LINDEX", key, -1)) < ttl then
  return 1
end

redis.call("LPUSH", key, ARGV[3])
redis.call("LTRIM", key, 0, lmt - 1)
redis.call("PEXPIRE", key, ARGV[4])
return 0
"#;

/// Key expiry for a duration in seconds; never 0, which would drop the key
/// right after writing it.
fn expiry_millis(secs: f64) -> u64 {
    (secs * 1000.0).ceil().max(1.0) as u64
}

fn command_error(op: &str, err: RedisError) -> StoreError {
    StoreError::command(format!("{op} failed: {err}"))
}

fn script_error(script: &ScriptExecutor, err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() {
        StoreError::connection(err.to_string())
    } else {
        StoreError::Script(format!("{}: {err}", script.name()))
    }
}

fn parse_timestamp(raw: &str) -> StoreResult<f64> {
    raw.parse()
        .map_err(|_| StoreError::command(format!("not a timestamp: {raw:?}")))
}

/// Throttle store talking to Redis over synchronous connections.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Arc<Client>,
    concurrency: Arc<ScriptExecutor>,
    backlog: Arc<ScriptExecutor>,
    threshold: Arc<ScriptExecutor>,
}

impl RedisStore {
    /// Create a store for `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> StoreResult<Self> {
        let client = Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::connection(e.to_string()))?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(client),
            concurrency: Arc::new(ScriptExecutor::new("concurrency", CONCURRENCY_SCRIPT)),
            backlog: Arc::new(ScriptExecutor::new("backlog", BACKLOG_SCRIPT)),
            threshold: Arc::new(ScriptExecutor::new("threshold", THRESHOLD_SCRIPT)),
        }
    }

    fn connection(&self) -> StoreResult<Connection> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::connection(e.to_string()))
    }
}

impl ThrottleStore for RedisStore {
    #[instrument(skip(self), err)]
    fn concurrency_acquire(
        &self,
        key: &str,
        backlog_key: &str,
        job_id: &str,
        limit: u64,
        ttl: f64,
        now: f64,
    ) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let args = [
            job_id.to_string(),
            limit.to_string(),
            ttl.to_string(),
            now.to_string(),
            expiry_millis(ttl).to_string(),
        ];
        let throttled: i64 = self
            .concurrency
            .evaluate(&mut conn, &[key, backlog_key], &args)
            .map_err(|e| script_error(&self.concurrency, e))?;
        Ok(throttled == 1)
    }

    #[instrument(skip(self), err)]
    fn concurrency_release(&self, key: &str, backlog_key: &str, job_id: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        redis::pipe()
            .cmd("ZREM")
            .arg(key)
            .arg(job_id)
            .ignore()
            .cmd("ZREM")
            .arg(backlog_key)
            .arg(job_id)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| command_error("ZREM", e))
    }

    fn concurrency_backlog_position(
        &self,
        backlog_key: &str,
        job_id: &str,
        now: f64,
    ) -> StoreResult<u64> {
        let mut conn = self.connection()?;
        let args = [job_id.to_string(), now.to_string()];
        self.backlog
            .evaluate(&mut conn, &[backlog_key], &args)
            .map_err(|e| script_error(&self.backlog, e))
    }

    fn concurrency_count(&self, key: &str, now: f64) -> StoreResult<u64> {
        let mut conn = self.connection()?;
        redis::cmd("ZCOUNT")
            .arg(key)
            .arg(now)
            .arg("+inf")
            .query(&mut conn)
            .map_err(|e| command_error("ZCOUNT", e))
    }

    fn concurrency_oldest_expiry(&self, key: &str, now: f64) -> StoreResult<Option<f64>> {
        let mut conn = self.connection()?;
        let reply: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(now)
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query(&mut conn)
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

        // [member, score]
        reply.get(1).map(|score| parse_timestamp(score)).transpose()
    }

    #[instrument(skip(self), err)]
    fn threshold_acquire(&self, key: &str, limit: u64, period: f64, now: f64) -> StoreResult<bool> {
        if limit == 0 {
            return Ok(true);
        }

        let mut conn = self.connection()?;
        let args = [
            limit.to_string(),
            period.to_string(),
            now.to_string(),
            expiry_millis(period).to_string(),
        ];
        let throttled: i64 = self
            .threshold
            .evaluate(&mut conn, &[key], &args)
            .map_err(|e| script_error(&self.threshold, e))?;
        Ok(throttled == 1)
    }

    fn threshold_count(&self, key: &str, _now: f64) -> StoreResult<u64> {
        let mut conn = self.connection()?;
        redis::cmd("LLEN")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("LLEN", e))
    }

    fn threshold_oldest(&self, key: &str, _now: f64) -> StoreResult<Option<f64>> {
        let mut conn = self.connection()?;
        let oldest: Option<String> = redis::cmd("LINDEX")
            .arg(key)
            .arg(-1)
            .query(&mut conn)
            .map_err(|e| command_error("LINDEX", e))?;
        oldest.as_deref().map(parse_timestamp).transpose()
    }

    #[instrument(skip(self), err)]
    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("DEL", e))?;
        Ok(())
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query(&mut conn)
            .map_err(|e| command_error("SADD", e))?;
        Ok(())
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query(&mut conn)
            .map_err(|e| command_error("SREM", e))?;
        Ok(())
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection()?;
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("SMEMBERS", e))?;
        members.sort();
        Ok(members)
    }
}
