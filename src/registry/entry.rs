use crate::database::factory::SessionFactory;
use crate::database::pool::ConnectionPool;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cached state for one database identifier
///
/// The factory, when present, is always derived from `pool`.
pub(crate) struct PoolEntry {
    pub pool: Arc<dyn ConnectionPool>,
    pub factory: Option<Arc<SessionFactory>>,
    pub last_touched: Instant,
    pub created_at: DateTime<Utc>,
    pub idle_threshold: Duration,
}

impl PoolEntry {
    pub fn new(pool: Arc<dyn ConnectionPool>, idle_threshold: Duration) -> Self {
        Self {
            pool,
            factory: None,
            last_touched: Instant::now(),
            created_at: Utc::now(),
            idle_threshold,
        }
    }

    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_touched)
    }

    /// Idle age in whole seconds has reached the threshold
    pub fn is_idle(&self, now: Instant) -> bool {
        self.idle_for(now).as_secs() >= self.idle_threshold.as_secs()
    }

    /// Force-close the pool; failures are logged, never returned
    pub async fn close(self, database_id: &str) {
        log::info!(
            "Closing pool for database '{}' (factory: {}, idle {}s)",
            database_id,
            self.factory.is_some(),
            self.idle_for(Instant::now()).as_secs()
        );

        if let Err(e) = self.pool.force_close_all().await {
            log::warn!(
                "Failed to close pool for database '{}': {}",
                database_id,
                e
            );
        }
    }
}
