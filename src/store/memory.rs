//! In-memory `StateStore` for tests. No TTL enforcement (tests control
//! expiry explicitly via `expire_lock_for_test`), no persistence across
//! process restarts — this backs the integration tests, not production.

use super::{LeaseToken, StateStore};
use crate::error::Result;
use crate::state::PipelineState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

struct LockEntry {
    token: String,
    expires_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, PipelineState>,
    locks: HashMap<String, LockEntry>,
    validation_failures: HashMap<(String, String), u32>,
}

/// In-memory implementation of [`StateStore`], guarded by a single `Mutex`.
/// Grounded on the teacher's [`MockBackend`](crate::backend::MockBackend) —
/// same role (deterministic substitute for an external dependency in tests)
/// applied to persistence instead of LLM calls.
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Test hook: force a lock to appear expired without waiting out its TTL.
    pub fn expire_lock_for_test(&self, report_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.locks.remove(report_id);
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, report_id: &str) -> Result<Option<PipelineState>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.states.get(report_id).cloned())
    }

    async fn save(&self, state: &PipelineState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.states.insert(state.report_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, report_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.states.remove(report_id);
        inner.locks.remove(report_id);
        inner
            .validation_failures
            .retain(|(r, _), _| r != report_id);
        Ok(())
    }

    async fn increment_validation_failure(&self, report_id: &str, step_name: &str) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let key = (report_id.to_string(), step_name.to_string());
        let counter = inner.validation_failures.entry(key).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn reset_validation_failure(&self, report_id: &str, step_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .validation_failures
            .remove(&(report_id.to_string(), step_name.to_string()));
        Ok(())
    }

    async fn acquire_pipeline_lock(
        &self,
        report_id: &str,
        lease_ms: u64,
    ) -> Result<Option<LeaseToken>> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        if let Some(existing) = inner.locks.get(report_id) {
            if existing.expires_at_ms > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        inner.locks.insert(
            report_id.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at_ms: now + lease_ms as i64,
            },
        );
        Ok(Some(token))
    }

    async fn verify_pipeline_lock(&self, report_id: &str, token: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .locks
            .get(report_id)
            .is_some_and(|l| l.token == token && l.expires_at_ms > now_ms()))
    }

    async fn release_pipeline_lock(&self, report_id: &str, token: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.locks.get(report_id) {
            if existing.token == token {
                inner.locks.remove(report_id);
            }
        }
        Ok(())
    }

    async fn extend_pipeline_lock(
        &self,
        report_id: &str,
        token: &str,
        lease_ms: u64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        match inner.locks.get_mut(report_id) {
            Some(entry) if entry.token == token && entry.expires_at_ms > now => {
                entry.expires_at_ms = now + lease_ms as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
