use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::{ScriptSpec, StateStore};

/// In-process engine for tests and single-node development.
///
/// Mirrors the semantics of every registered script under one lock, so the
/// atomicity contract matches the Redis engine.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    sorted: HashMap<String, SortedEntry>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct SortedEntry {
    // score -> members; BTreeMap keeps range removal cheap
    members: BTreeMap<i64, Vec<String>>,
    expires_at: Option<Instant>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn live_string(&mut self, key: &str) -> Option<&mut StringEntry> {
        let expired = self
            .strings
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        if expired {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn live_sorted(&mut self, key: &str) -> &mut SortedEntry {
        let expired = self
            .sorted
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        if expired {
            self.sorted.remove(key);
        }
        self.sorted.entry(key.to_string()).or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut guard = self.inner.lock().await;
        Ok(guard.live_string(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;
        guard.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut guard = self.inner.lock().await;
        if guard.live_string(key).is_some() {
            return Ok(false);
        }
        guard.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;
        guard.strings.remove(key);
        guard.sorted.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut guard = self.inner.lock().await;
        let current = guard
            .live_string(key)
            .map(|entry| entry.value.parse::<i64>().unwrap_or(0))
            .unwrap_or(0);
        let next = current + delta;
        let expires_at = guard.strings.get(key).and_then(|entry| entry.expires_at);
        guard.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut guard = self.inner.lock().await;
        let entry = guard.live_sorted(key);
        entry
            .members
            .entry(score)
            .or_default()
            .push(member.to_string());
        Ok(())
    }

    async fn sorted_set_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        let mut guard = self.inner.lock().await;
        let entry = guard.live_sorted(key);
        let mut removed = 0u64;
        let scores: Vec<i64> = entry
            .members
            .range(min..=max)
            .map(|(score, _)| *score)
            .collect();
        for score in scores {
            if let Some(members) = entry.members.remove(&score) {
                removed += members.len() as u64;
            }
        }
        Ok(removed)
    }

    async fn sorted_set_count(&self, key: &str) -> StoreResult<u64> {
        let mut guard = self.inner.lock().await;
        let entry = guard.live_sorted(key);
        Ok(entry.members.values().map(|members| members.len() as u64).sum())
    }

    async fn eval_script(
        &self,
        script: &ScriptSpec,
        keys: &[&str],
        args: &[&str],
    ) -> StoreResult<Vec<i64>> {
        match script.name {
            "sliding_window" => {
                let key = keys
                    .first()
                    .ok_or_else(|| StoreError::Transient("sliding_window: missing key".into()))?;
                let parse = |idx: usize| -> StoreResult<i64> {
                    args.get(idx)
                        .and_then(|value| value.parse::<i64>().ok())
                        .ok_or_else(|| {
                            StoreError::Transient(format!("sliding_window: bad arg {idx}"))
                        })
                };
                let now_ms = parse(0)?;
                let window_ms = parse(1)?;
                let max = parse(2)?;
                let member = args
                    .get(3)
                    .ok_or_else(|| StoreError::Transient("sliding_window: missing member".into()))?;
                let ttl_secs = parse(4)?;

                let mut guard = self.inner.lock().await;
                let entry = guard.live_sorted(key);
                let cutoff = now_ms - window_ms;
                let stale: Vec<i64> = entry
                    .members
                    .range(..=cutoff)
                    .map(|(score, _)| *score)
                    .collect();
                for score in stale {
                    entry.members.remove(&score);
                }
                let count: i64 = entry
                    .members
                    .values()
                    .map(|members| members.len() as i64)
                    .sum();
                if count < max {
                    entry
                        .members
                        .entry(now_ms)
                        .or_default()
                        .push((*member).to_string());
                    entry.expires_at =
                        Some(Instant::now() + Duration::from_secs(ttl_secs.max(1) as u64));
                    Ok(vec![1, count + 1])
                } else {
                    Ok(vec![0, count])
                }
            }
            _ => Err(StoreError::UnsupportedScript(script.name)),
        }
    }

    async fn publish(&self, _channel: &str, _payload: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
