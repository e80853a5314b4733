//! Server-side Lua scripts with a cached handle.
//!
//! A script is loaded once (`SCRIPT LOAD`) and invoked by SHA afterwards. If
//! the server forgot it (restart, `SCRIPT FLUSH`, failover) the first
//! `EVALSHA` fails with `NOSCRIPT`; the executor then reloads and retries
//! exactly once.

use std::sync::{Mutex, PoisonError};

use redis::{ConnectionLike, ErrorKind, FromRedisValue, RedisResult, ToRedisArgs};
use tracing::debug;

/// A Lua script plus its cached SHA.
#[derive(Debug)]
pub struct ScriptExecutor {
    name: &'static str,
    source: &'static str,
    sha: Mutex<Option<String>>,
}

impl ScriptExecutor {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            sha: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the script against `conn`.
    ///
    /// Errors other than `NOSCRIPT` are returned unchanged.
    pub fn evaluate<C, K, A, T>(&self, conn: &mut C, keys: &[K], args: &[A]) -> RedisResult<T>
    where
        C: ConnectionLike,
        K: ToRedisArgs,
        A: ToRedisArgs,
        T: FromRedisValue,
    {
        let sha = match self.cached_sha() {
            Some(sha) => sha,
            None => self.load(conn)?,
        };

        match Self::evalsha(conn, &sha, keys, args) {
            Err(err) if err.kind() == ErrorKind::NoScriptError => {
                debug!(script = self.name, "script missing on server; reloading");
                let sha = self.load(conn)?;
                Self::evalsha(conn, &sha, keys, args)
            }
            other => other,
        }
    }

    /// Forget the cached handle.
    pub fn reset(&self) {
        *self.sha.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn cached_sha(&self) -> Option<String> {
        self.sha
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn load<C: ConnectionLike>(&self, conn: &mut C) -> RedisResult<String> {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(self.source)
            .query(conn)?;
        *self.sha.lock().unwrap_or_else(PoisonError::into_inner) = Some(sha.clone());
        Ok(sha)
    }

    fn evalsha<C, K, A, T>(conn: &mut C, sha: &str, keys: &[K], args: &[A]) -> RedisResult<T>
    where
        C: ConnectionLike,
        K: ToRedisArgs,
        A: ToRedisArgs,
        T: FromRedisValue,
    {
        redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query(conn)
    }
}
