//! PostgreSQL connection pool.

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DatabaseSettings;
use crate::persistence::PersistenceError;

pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;
pub type PooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Cloneable handle to a shared r2d2 pool
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool>,
}

impl Database {
    pub fn connect(settings: &DatabaseSettings) -> Result<Self, PersistenceError> {
        let config = DatabaseConfig {
            max_connections: settings.max_connections,
            connection_timeout_secs: settings.connection_timeout_secs,
            ..DatabaseConfig::default()
        };
        Self::new_with_config(&settings.url(), config)
    }

    /// Pool creation does not fail when the server is down; connections are made lazily
    pub fn new_with_config(database_url: &str, config: DatabaseConfig) -> Result<Self, PersistenceError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);

        let pool = r2d2::Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(config.min_idle))
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .max_lifetime(Some(Duration::from_secs(config.max_lifetime_secs)))
            .build_unchecked(manager);

        Ok(Database {
            pool: Arc::new(pool),
        })
    }

    pub fn get_connection(&self) -> Result<PooledConnection, PersistenceError> {
        Ok(self.pool.get()?)
    }

    pub fn test_connection(&self) -> Result<(), PersistenceError> {
        let mut conn = self.get_connection()?;
        diesel::sql_query("SELECT 1").execute(&mut conn)?;
        Ok(())
    }

    /// Run `f` with a pooled connection on the blocking thread pool
    pub async fn run<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.get_connection()?;
            f(&mut conn)
        })
        .await?
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            max_connections: 15,
            min_idle: 1,
            connection_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}
