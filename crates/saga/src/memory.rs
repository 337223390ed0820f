//! In-memory saga state store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::OrderNumber;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    CounterField, FlagField, Result, SagaError, SagaState, SagaStateStore, state::saga_key,
};

#[derive(Debug)]
struct Entry {
    state: SagaState,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    unavailable: bool,
    failing_gets: u32,
    failing_deletes: u32,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(SagaError::StoreUnavailable(
                "injected store failure".to_string(),
            ));
        }
        Ok(())
    }

    fn take_failure(remaining: &mut u32, op: &str) -> Result<()> {
        if *remaining > 0 {
            *remaining -= 1;
            return Err(SagaError::StoreUnavailable(format!("injected {op} failure")));
        }
        Ok(())
    }

    /// Returns the live entry for an order, dropping it first if it expired.
    fn live(&mut self, order_number: &OrderNumber) -> Option<&mut SagaState> {
        let key = saga_key(order_number);
        if self
            .entries
            .get(&key)
            .is_some_and(|entry| entry.deadline <= Instant::now())
        {
            self.entries.remove(&key);
        }
        self.entries.get_mut(&key).map(|entry| &mut entry.state)
    }
}

/// In-memory saga state store.
///
/// Deadlines use `tokio::time::Instant`, so tests running with a paused
/// clock can expire sagas with `tokio::time::advance`.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemorySagaStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail as unavailable until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Makes the next `count` reads fail as unavailable.
    pub async fn fail_next_gets(&self, count: u32) {
        self.inner.lock().await.failing_gets = count;
    }

    /// Makes the next `count` deletes fail as unavailable.
    pub async fn fail_next_deletes(&self, count: u32) {
        self.inner.lock().await.failing_deletes = count;
    }

    /// Number of sagas that have not expired.
    pub async fn live_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .await
            .entries
            .values()
            .filter(|entry| entry.deadline > now)
            .count()
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStateStore {
    async fn create(&self, state: &SagaState, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.entries.insert(
            state.key(),
            Entry {
                state: state.clone(),
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, order_number: &OrderNumber) -> Result<Option<SagaState>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        Inner::take_failure(&mut inner.failing_gets, "get")?;
        Ok(inner.live(order_number).cloned())
    }

    async fn increment(
        &self,
        order_number: &OrderNumber,
        field: CounterField,
        delta: i64,
    ) -> Result<Option<i64>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner.live(order_number).map(|state| match field {
            CounterField::ReceivedItems => {
                state.received_items = state.received_items.saturating_add(delta);
                state.received_items
            }
        }))
    }

    async fn set_flag_if_unset(
        &self,
        order_number: &OrderNumber,
        field: FlagField,
    ) -> Result<Option<bool>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner.live(order_number).map(|state| match field {
            FlagField::Failed => !std::mem::replace(&mut state.failed, true),
        }))
    }

    async fn mark_seen(&self, order_number: &OrderNumber, member: &str) -> Result<Option<bool>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .live(order_number)
            .map(|state| state.seen.insert(member.to_string())))
    }

    async fn count_once(
        &self,
        order_number: &OrderNumber,
        member: &str,
        field: CounterField,
    ) -> Result<Option<bool>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner.live(order_number).map(|state| {
            let added = state.seen.insert(member.to_string());
            if added {
                match field {
                    CounterField::ReceivedItems => {
                        state.received_items = state.received_items.saturating_add(1);
                    }
                }
            }
            added
        }))
    }

    async fn delete(&self, order_number: &OrderNumber) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        Inner::take_failure(&mut inner.failing_deletes, "delete")?;
        inner.entries.remove(&saga_key(order_number));
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.deadline > now);
        Ok((before - inner.entries.len()) as u64)
    }
}
