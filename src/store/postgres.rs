//! PostgreSQL counter store.
//!
//! Counters live in the `rate_limits` table created by
//! `migrations/001_rate_limits.sql`. The atomic strategy calls the
//! `increment_rate_limit` function from the same migration; the best-effort
//! strategy works against the bare table.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::{debug, info, instrument, trace};

use crate::config::StorageConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{CounterKey, CounterStore, IncrementStrategy};

/// Schema for the counter table and the atomic increment function.
pub const SCHEMA: &str = include_str!("../../migrations/001_rate_limits.sql");

/// Name of the server-side atomic increment function.
pub const INCREMENT_FUNCTION: &str = "increment_rate_limit";

/// Resolves the increment function the way `CALL_INCREMENT` will: through
/// `search_path` and with the exact argument types.
const LOOKUP_INCREMENT_FUNCTION: &str =
    "SELECT to_regprocedure('increment_rate_limit(uuid, text, timestamptz)') IS NOT NULL";

const SELECT_COUNT: &str = "SELECT request_count FROM rate_limits \
     WHERE user_id = $1 AND endpoint = $2 AND window_start = $3";

const CALL_INCREMENT: &str = "SELECT increment_rate_limit($1, $2, $3)";

const UPDATE_COUNT: &str = "UPDATE rate_limits \
     SET request_count = request_count + 1, updated_at = now() \
     WHERE user_id = $1 AND endpoint = $2 AND window_start = $3";

const INSERT_COUNT: &str = "INSERT INTO rate_limits \
     (user_id, endpoint, window_start, request_count, updated_at) \
     VALUES ($1, $2, $3, 1, now()) \
     ON CONFLICT (user_id, endpoint, window_start) \
     DO UPDATE SET request_count = rate_limits.request_count + 1, updated_at = now()";

const DELETE_BEFORE: &str = "DELETE FROM rate_limits WHERE window_start < $1";

/// Counter store backed by a pooled PostgreSQL connection.
#[derive(Clone)]
pub struct PostgresCounterStore {
    pool: Pool,
    strategy: IncrementStrategy,
    timeout: Duration,
}

impl PostgresCounterStore {
    /// Create the pool and resolve the increment strategy.
    ///
    /// With `IncrementStrategy::Auto` this checks once whether
    /// `increment_rate_limit` exists and falls back to best-effort if not.
    /// Explicit strategies do not touch the database here.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        info!(
            max_size = config.pool_size,
            strategy = %config.increment_strategy,
            "Creating counter store connection pool"
        );

        let pg_config: tokio_postgres::Config = config
            .database_url
            .parse()
            .map_err(|e| TollgateError::Config(format!("Invalid database URL: {}", e)))?;

        Self::from_pg_config(pg_config, config).await
    }

    /// Like `connect`, with an already parsed connection config.
    pub async fn from_pg_config(
        pg_config: tokio_postgres::Config,
        config: &StorageConfig,
    ) -> Result<Self> {
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(pg_config, NoTls, manager_config);

        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| TollgateError::Pool(e.to_string()))?;

        // Explicit strategies are taken as given; only `Auto` asks the database.
        let mut store = Self {
            pool,
            strategy: config.increment_strategy,
            timeout: Duration::from_millis(config.statement_timeout_ms),
        };

        if store.strategy == IncrementStrategy::Auto {
            store.strategy = store.detect_strategy().await?;
        }

        Ok(store)
    }

    /// Pick `Atomic` if the increment function is installed, else `BestEffort`.
    pub async fn detect_strategy(&self) -> Result<IncrementStrategy> {
        let available: bool = self
            .bounded(async {
                let conn = self.conn().await?;
                let row = conn.query_one(LOOKUP_INCREMENT_FUNCTION, &[]).await?;
                Ok::<_, TollgateError>(row.get::<_, bool>(0))
            })
            .await?;

        let strategy = if available {
            IncrementStrategy::Atomic
        } else {
            IncrementStrategy::BestEffort
        };

        info!(
            function = INCREMENT_FUNCTION,
            available,
            strategy = %strategy,
            "Resolved counter increment strategy"
        );
        Ok(strategy)
    }

    /// Apply the bundled schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        self.bounded(async {
            let conn = self.conn().await?;
            conn.batch_execute(SCHEMA).await?;
            Ok::<_, TollgateError>(())
        })
        .await?;

        info!("Counter schema applied");
        Ok(())
    }

    /// Check that a pooled connection can run a query within the deadline.
    pub async fn is_healthy(&self) -> bool {
        let check = async {
            match self.pool.get().await {
                Ok(conn) => conn.simple_query("SELECT 1").await.is_ok(),
                Err(_) => false,
            }
        };
        tokio::time::timeout(self.timeout, check)
            .await
            .unwrap_or(false)
    }

    async fn conn(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| TollgateError::Pool(e.to_string()))
    }

    /// Run a storage call under the configured deadline.
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| TollgateError::Timeout(self.timeout.as_millis() as u64))?
    }

    async fn increment_atomic(&self, key: &CounterKey) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            CALL_INCREMENT,
            &[&key.user_id, &key.endpoint.as_str(), &key.window_start],
        )
        .await?;
        Ok(())
    }

    /// Read, then update the existing row or insert a new one.
    ///
    /// The update is relative (`request_count + 1`) and the insert resolves a
    /// concurrent first write with `ON CONFLICT`, so racing writers cannot
    /// overwrite each other's increments.
    async fn increment_best_effort(&self, key: &CounterKey) -> Result<()> {
        let conn = self.conn().await?;
        let endpoint = key.endpoint.as_str();
        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 3] =
            [&key.user_id, &endpoint, &key.window_start];

        // Bump the row in place if this window already has one
        let existing = conn.query_opt(SELECT_COUNT, &params).await?;
        let updated = match existing {
            Some(_) => conn.execute(UPDATE_COUNT, &params).await?,
            None => 0,
        };

        // The row may have been swept or never existed.
        if updated == 0 {
            conn.execute(INSERT_COUNT, &params).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    #[instrument(skip(self, key), fields(key = %key))]
    async fn read_count(&self, key: &CounterKey) -> Result<u64> {
        self.bounded(async {
            let conn = self.conn().await?;
            let row = conn
                .query_opt(
                    SELECT_COUNT,
                    &[&key.user_id, &key.endpoint.as_str(), &key.window_start],
                )
                .await?;

            // No row yet means nothing recorded in this window
            let count = row.map(|r| r.get::<_, i64>(0)).unwrap_or(0);
            Ok::<_, TollgateError>(u64::try_from(count).unwrap_or(0))
        })
        .await
    }

    #[instrument(skip(self, key), fields(key = %key, strategy = %self.strategy))]
    async fn increment_count(&self, key: &CounterKey) -> Result<()> {
        self.bounded(async {
            match self.strategy {
                IncrementStrategy::BestEffort => self.increment_best_effort(key).await,
                _ => self.increment_atomic(key).await,
            }
        })
        .await?;

        trace!("Incremented counter");
        Ok(())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = self
            .bounded(async {
                let conn = self.conn().await?;
                Ok::<_, TollgateError>(conn.execute(DELETE_BEFORE, &[&cutoff]).await?)
            })
            .await?;

        debug!(cutoff = %cutoff, removed, "Deleted expired counters");
        Ok(removed)
    }

    fn strategy(&self) -> IncrementStrategy {
        self.strategy
    }
}
