//! Configuration loaded from environment variables.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::worker::WorkerOptions;

#[derive(Debug, Clone)]
pub struct Config {
    /// Required by the Postgres-backed worker binary; the in-process store
    /// does not need it.
    pub database_url: Option<String>,
    pub worker_name: Option<String>,
    pub work_jobs_interval: f64,
    pub flag_jobs_interval: f64,
    pub collect_stats_interval: f64,
    pub remove_jobs_interval: f64,
    pub kill_grace: f64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            worker_name: env::var("GRISTMILL_WORKER_NAME").ok(),
            work_jobs_interval: secs_var("GRISTMILL_WORK_JOBS_INTERVAL", 0.25)?,
            flag_jobs_interval: secs_var("GRISTMILL_FLAG_JOBS_INTERVAL", 3.0)?,
            collect_stats_interval: secs_var("GRISTMILL_COLLECT_STATS_INTERVAL", 30.0)?,
            remove_jobs_interval: secs_var("GRISTMILL_REMOVE_JOBS_INTERVAL", 1.0)?,
            kill_grace: secs_var("GRISTMILL_KILL_GRACE", 3.0)?,
        })
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: self.worker_name.clone(),
            work_jobs_interval: self.work_jobs_interval,
            flag_jobs_interval: self.flag_jobs_interval,
            collect_stats_interval: self.collect_stats_interval,
            remove_jobs_interval: self.remove_jobs_interval,
            kill_grace: self.kill_grace,
            ..WorkerOptions::default()
        }
    }
}

fn secs_var(key: &str, default: f64) -> Result<f64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("{key} must be a number of seconds, got [{raw}]")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secs_var_defaults_when_unset() {
        assert_eq!(secs_var("GRISTMILL_TEST_UNSET_INTERVAL", 1.5).unwrap(), 1.5);
    }

    #[test]
    fn secs_var_rejects_garbage() {
        env::set_var("GRISTMILL_TEST_BAD_INTERVAL", "soon");
        assert!(secs_var("GRISTMILL_TEST_BAD_INTERVAL", 1.0).is_err());
        env::remove_var("GRISTMILL_TEST_BAD_INTERVAL");
    }
}
