//! PostgreSQL pool and migrations

use hookline_common::config::DatabaseConfig;
use hookline_common::{Error, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Shared PostgreSQL pool
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect using the `database` config section
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = connection_url(config)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        debug!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "PostgreSQL pool ready"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Applying {} known migrations", MIGRATOR.iter().count());

        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))
    }

    /// Round-trip a trivial query, returning its latency
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(started.elapsed())
    }
}

fn connection_url(config: &DatabaseConfig) -> Result<&str> {
    if config.backend != "postgres" {
        return Err(Error::Config(format!(
            "Database backend {} has no connection pool",
            config.backend
        )));
    }
    config
        .url
        .as_deref()
        .ok_or_else(|| Error::Config("database.url is required for postgres".to_string()))
}
