//! Connection pool and health check.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};

use crate::error::DbError;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "vaultkeep".to_string(),
            username: "vaultkeep".to_string(),
            password: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct PoolConfigBuilder {
    inner: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.inner.host = host.into();
        self
    }
    pub fn port(mut self, port: u16) -> Self {
        self.inner.port = port;
        self
    }
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.inner.database = database.into();
        self
    }
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.inner.username = username.into();
        self
    }
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.inner.password = password.into();
        self
    }
    pub fn max_connections(mut self, n: u32) -> Self {
        self.inner.max_connections = n;
        self
    }
    pub fn min_connections(mut self, n: u32) -> Self {
        self.inner.min_connections = n;
        self
    }
    pub fn build(self) -> PoolConfig {
        self.inner
    }
}

pub struct Pool {
    inner: PgPool,
    config: PoolConfig,
}

impl Pool {
    pub async fn new(config: PoolConfig) -> Result<Self, DbError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .disable_statement_logging();

        let inner = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(options)
            .await?;

        Ok(Self { inner, config })
    }

    pub async fn from_url(url: &str, max_connections: u32) -> Result<Self, DbError> {
        let inner = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self {
            inner,
            config: PoolConfig {
                max_connections,
                ..Default::default()
            },
        })
    }

    pub fn inner(&self) -> &PgPool {
        &self.inner
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub async fn health_check(&self) -> Result<HealthStatus, DbError> {
        let started = std::time::Instant::now();
        sqlx::query("SELECT 1").execute(&self.inner).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(HealthStatus {
            healthy: true,
            latency_ms,
            connections: self.inner.size(),
            idle_connections: self.inner.num_idle() as u32,
        })
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.inner.size(),
            idle: self.inner.num_idle() as u32,
            max: self.config.max_connections,
            min: self.config.min_connections,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    pub connections: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max: u32,
    pub min: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = PoolConfig::builder()
            .host("db.internal")
            .port(5433)
            .database("vk")
            .username("vk_user")
            .password("secret")
            .max_connections(25)
            .min_connections(2)
            .build();

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 25);
        assert_eq!(config.min_connections, 2);
    }
}
