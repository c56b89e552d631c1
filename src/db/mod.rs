//! Metadata store: connection pooling, migrations, transactions, and repositories.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod repository;
pub mod transaction;

pub use migrations::{default_migrations, Migration, MigrationManager};
pub use models::*;
pub use pool::{HealthStatus, Pool, PoolConfig, PoolStats};
pub use repository::{
    BackupRunRepository, JobRepository, NotificationRepository, SnapshotRepository,
    StorageMetricRepository,
};
pub use transaction::{DbTransaction, IsolationLevel, TransactionManager};
