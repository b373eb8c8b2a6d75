pub mod error;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

pub use crate::error::{StoreError, StoreResult};
pub use crate::memory::MemoryStore;
pub use crate::redis_store::RedisStore;

/// A server-side script registered by this workspace.
///
/// The Redis engine executes `source` atomically; the in-memory engine
/// mirrors the semantics of each registered `name` under its own lock so
/// tests observe the same atomicity.
#[derive(Debug, Clone, Copy)]
pub struct ScriptSpec {
    pub name: &'static str,
    pub source: &'static str,
}

/// Atomic sliding-window check-and-insert.
///
/// KEYS[1] = window key; ARGV = now_ms, window_ms, max, member, ttl_secs.
/// Returns {allowed (0|1), count-after-decision}.
pub const SLIDING_WINDOW_SCRIPT: ScriptSpec = ScriptSpec {
    name: "sliding_window",
    source: r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, tonumber(ARGV[1]) - tonumber(ARGV[2]))
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[1], tonumber(ARGV[1]), ARGV[4])
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[5]))
  return {1, count + 1}
end
return {0, count}
"#,
};

/// Minimal remote key/value interface the gateway relies on.
///
/// Every operation may fail transiently (caller may retry) or persistently
/// (caller treats the connection as unusable and degrades). `eval_script`
/// is the atomicity point for cross-process serialization.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    /// SET NX with TTL. Returns true when the key was newly created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;
    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;
    async fn sorted_set_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;
    async fn sorted_set_count(&self, key: &str) -> StoreResult<u64>;
    async fn eval_script(
        &self,
        script: &ScriptSpec,
        keys: &[&str],
        args: &[&str],
    ) -> StoreResult<Vec<i64>>;
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    async fn ping(&self) -> StoreResult<()>;
}
