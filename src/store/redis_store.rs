//! Redis-backed `StateStore`. Grounded on
//! `examples/monokrome-foiacquire/src/rate_limit/redis.rs`: a
//! `ConnectionManager` for cheap-to-clone pooled connections, `redis::Script`
//! for atomic Lua operations (lock acquire/verify/release need to be atomic
//! compare-and-swap, which plain `GET`+`SET` cannot give us), and
//! `redis::pipe()` for batched TTL'd writes.

use super::{LeaseToken, StateStore};
use crate::error::{PipelineError, Result};
use crate::state::PipelineState;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

/// State blobs and abandoned lock keys both expire after this long, per
/// spec §3 "a separate TTL on the backing store prevents unbounded
/// retention of abandoned runs".
const STATE_TTL_SECS: i64 = 7 * 24 * 3600;
const VALIDATION_FAILURE_TTL_SECS: i64 = 7 * 24 * 3600;

fn state_key(report_id: &str) -> String {
    format!("pipeline:state:{}", report_id)
}

fn lock_key(report_id: &str) -> String {
    format!("pipeline:lock:{}", report_id)
}

fn validation_failure_key(report_id: &str, step_name: &str) -> String {
    format!("pipeline:valfail:{}:{}", report_id, step_name)
}

pub struct RedisStateStore {
    conn: ConnectionManager,
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| PipelineError::StateUnavailable(format!("redis connect: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| PipelineError::StateUnavailable(format!("redis connection manager: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, report_id: &str) -> Result<Option<PipelineState>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(state_key(report_id))
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        }
    }

    async fn save(&self, state: &PipelineState) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(state)?;
        redis::pipe()
            .set(state_key(&state.report_id), body)
            .expire(state_key(&state.report_id), STATE_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, report_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(state_key(report_id))
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn increment_validation_failure(&self, report_id: &str, step_name: &str) -> Result<u32> {
        let mut conn = self.conn.clone();
        let key = validation_failure_key(report_id, step_name);
        let (count,): (u32,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .ignore()
            .get(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        let _: () = conn
            .expire(&key, VALIDATION_FAILURE_TTL_SECS)
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(count)
    }

    async fn reset_validation_failure(&self, report_id: &str, step_name: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(validation_failure_key(report_id, step_name))
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn acquire_pipeline_lock(
        &self,
        report_id: &str,
        lease_ms: u64,
    ) -> Result<Option<LeaseToken>> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();
        // SET key token NX PX lease_ms — atomic acquire-if-absent.
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key(report_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(acquired.map(|_| token))
    }

    async fn verify_pipeline_lock(&self, report_id: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let current: Option<String> = conn
            .get(lock_key(report_id))
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(current.as_deref() == Some(token))
    }

    async fn release_pipeline_lock(&self, report_id: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        // Compare-and-delete: only remove the lock if it still holds our
        // token, so a worker never releases a lease another worker since
        // acquired. Same Lua-CAS shape as the foiacquire rate limiter's
        // `acquire` script.
        let script = Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );
        let _: i64 = script
            .key(lock_key(report_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn extend_pipeline_lock(
        &self,
        report_id: &str,
        token: &str,
        lease_ms: u64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        // Compare-and-refresh: only PEXPIRE if the token we hold still owns
        // the lock, same CAS shape as `release_pipeline_lock`.
        let script = Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
            "#,
        );
        let extended: i64 = script
            .key(lock_key(report_id))
            .arg(token)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| PipelineError::StateUnavailable(e.to_string()))?;
        Ok(extended == 1)
    }
}
