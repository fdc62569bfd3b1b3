// Worker binary: runs the control loop against a Postgres-backed store.
//
// Host applications embed the library and register their own job classes;
// this binary wires configuration, migrations, the child-mode entry point
// and signal handling around an (initially empty) registry.

use std::sync::Arc;

use anyhow::{Context, Result};
use gristmill::{
    child_main, Config, JobRegistry, PostgresStore, ProcessLauncher, QueueStore, Worker,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gristmill=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;

    tracing::info!("Connecting to store...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("Failed to connect to the store")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store: Arc<dyn QueueStore> = Arc::new(PostgresStore::new(pool));

    // Job classes are registered by embedding applications; the stock binary
    // supervises, flags and removes but has nothing of its own to execute.
    let registry = Arc::new(JobRegistry::new());

    // Re-executed as a job child?
    if child_main(registry.clone(), store.clone()).await? {
        return Ok(());
    }

    let launcher = Arc::new(ProcessLauncher::current_exe()?);
    let worker = Arc::new(Worker::new(
        store,
        registry,
        launcher,
        config.worker_options(),
    ));

    let handle = worker.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        handle.request_exit();
    });

    worker.run().await
}
