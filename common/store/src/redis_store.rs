use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{StoreError, StoreResult};
use crate::{ScriptSpec, StateStore};

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| StoreError::Persistent(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| StoreError::Persistent(err.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.incr(key, delta).await?)
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_set_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        Ok(conn.zrembyscore(key, min, max).await?)
    }

    async fn sorted_set_count(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn eval_script(
        &self,
        script: &ScriptSpec,
        keys: &[&str],
        args: &[&str],
    ) -> StoreResult<Vec<i64>> {
        let mut conn = self.manager.clone();
        let script = redis::Script::new(script.source);
        let mut prepared = script.prepare_invoke();
        for key in keys {
            prepared.key(*key);
        }
        for arg in args {
            prepared.arg(*arg);
        }
        Ok(prepared.invoke_async(&mut conn).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
