use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::warn;

use super::state::RateLimiterState;
use super::store::LimiterStateStore;
use crate::clock::Clock;
use crate::error::StateError;

/// Single-row table shared by every host pointed at the same database.
/// Concurrent updates serialize on the row lock.
#[derive(Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
    hourly_limit: u32,
    clock: Clock,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool, hourly_limit: u32, clock: Clock) -> Self {
        Self {
            pool,
            hourly_limit,
            clock,
        }
    }

    fn decode(&self, raw: Option<serde_json::Value>) -> RateLimiterState {
        let now = self.clock.now_ms();
        let mut state = match raw.map(serde_json::from_value::<RateLimiterState>) {
            Some(Ok(state)) => state,
            Some(Err(err)) => {
                warn!(
                    stage = "limiter_state",
                    event = "state.corrupt",
                    error = %err,
                    "rate limiter row is corrupt, falling back to a fresh budget"
                );
                RateLimiterState::fresh(self.hourly_limit, now)
            }
            None => RateLimiterState::fresh(self.hourly_limit, now),
        };
        state.refresh(self.hourly_limit, now);
        state
    }
}

#[async_trait]
impl LimiterStateStore for PostgresStateStore {
    async fn load(&self) -> Result<RateLimiterState, StateError> {
        let raw: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT state FROM rate_limiter_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(self.decode(raw))
    }

    async fn update(
        &self,
        apply: &mut (dyn for<'s> FnMut(&'s mut RateLimiterState) + Send),
    ) -> Result<RateLimiterState, StateError> {
        let mut tx = self.pool.begin().await?;

        let seed = RateLimiterState::fresh(self.hourly_limit, self.clock.now_ms());
        sqlx::query(
            "INSERT INTO rate_limiter_state (id, state) VALUES (1, $1)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(Json(&seed))
        .execute(tx.as_mut())
        .await?;

        let raw: serde_json::Value =
            sqlx::query_scalar("SELECT state FROM rate_limiter_state WHERE id = 1 FOR UPDATE")
                .fetch_one(tx.as_mut())
                .await?;

        let mut state = self.decode(Some(raw));
        apply(&mut state);

        sqlx::query("UPDATE rate_limiter_state SET state = $1, updated_at = NOW() WHERE id = 1")
            .bind(Json(&state))
            .execute(tx.as_mut())
            .await?;

        tx.commit().await?;
        Ok(state)
    }

    fn describe(&self) -> String {
        "postgres:rate_limiter_state".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::{NOW, test_database};

    #[tokio::test]
    async fn concurrent_updates_serialize_on_the_row() {
        let Some(db) = test_database().await else {
            return;
        };
        sqlx::query("DELETE FROM rate_limiter_state")
            .execute(db.pool())
            .await
            .expect("clear state");
        let store = Arc::new(PostgresStateStore::new(db.pool().clone(), 100, Clock::starting_at(NOW)));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&mut |state| {
                        state.try_admit(100, NOW);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("update");
        }

        let state = store.load().await.expect("load");
        assert_eq!(state.tokens_remaining, 80);
        assert_eq!(state.requests_this_window, 20);
        assert_eq!(state.admissions_in_window(NOW), 20);
    }
}
