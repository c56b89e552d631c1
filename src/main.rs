//! Daemon entry point: load config, init tracing, open the pool, run migrations,
//! build the long-lived services, then block on the scheduler loop. `anyhow` is
//! used only at this boundary — every library module returns `vaultkeep::Error`.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use vaultkeep::config::AppConfig;
use vaultkeep::db::migrations::{default_migrations, MigrationManager};
use vaultkeep::db::pool::Pool;
use vaultkeep::encryption::EncryptionManager;
use vaultkeep::scheduler::Scheduler;
use vaultkeep::storage::s3::S3Backend;
use vaultkeep::storage::{S3Config, StorageBackend};
use vaultkeep::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config);

    tracing::info!(version = vaultkeep::VERSION, "starting vaultkeepd");

    let pool = Pool::from_url(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to the metadata store")?;

    MigrationManager::new(pool.inner())
        .migrate(&default_migrations())
        .await
        .context("failed to apply database migrations")?;

    let s3_config = S3Config {
        region: config.object_store.region.clone(),
        bucket: config.object_store.bucket.clone(),
        endpoint: config.object_store.endpoint.clone(),
        access_key: config.object_store.access_key.clone(),
        secret_key: config.object_store.secret_key.clone(),
        connect_timeout: std::time::Duration::from_secs(config.object_store.connect_timeout_secs),
        read_timeout: std::time::Duration::from_secs(config.object_store.read_timeout_secs),
        multipart_threshold_bytes: config.object_store.multipart_threshold_bytes,
        multipart_chunk_size_bytes: config.object_store.multipart_chunk_size_bytes,
    };
    let retry_policy = config.retry.to_policy();
    let storage: Arc<dyn StorageBackend> = Arc::new(
        S3Backend::new(s3_config, retry_policy)
            .await
            .context("failed to initialize the object store client")?,
    );

    let (passphrase, salt) = resolve_encryption_material(&config)
        .await
        .context("failed to resolve encryption key material")?;

    let worker = Arc::new(Worker::new(
        pool.inner().clone(),
        storage.clone(),
        config.log_dir.clone(),
        passphrase,
        salt,
    ));

    let recovered = worker
        .recover_orphans()
        .await
        .context("failed to recover orphaned runs")?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "recovered orphaned runs from a previous process");
    }

    let scheduler = Scheduler::new(pool.inner().clone(), worker.clone());
    tracing::info!("entering scheduler loop");
    scheduler
        .run(std::time::Duration::from_secs(30))
        .await
        .context("scheduler loop exited")?;

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_new(&config.logging.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Returns `(passphrase, salt)` when encryption is enabled, generating and persisting
/// a salt on first run if one was not configured. One salt for the process's
/// lifetime; there is no rotation path.
async fn resolve_encryption_material(
    config: &AppConfig,
) -> anyhow::Result<(Option<String>, Option<String>)> {
    if !config.encryption.enabled {
        return Ok((None, None));
    }

    let salt = if !config.encryption.salt.trim().is_empty() {
        config.encryption.salt.clone()
    } else if let Ok(existing) = tokio::fs::read_to_string(&config.encryption.salt_path).await {
        existing.trim().to_string()
    } else {
        let generated = EncryptionManager::generate_salt();
        if let Some(parent) = std::path::Path::new(&config.encryption.salt_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&config.encryption.salt_path, &generated).await?;
        tracing::info!(path = %config.encryption.salt_path, "generated new encryption salt");
        generated
    };

    Ok((Some(config.encryption.passphrase.clone()), Some(salt)))
}
