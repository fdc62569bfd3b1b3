//! Job class registry.
//!
//! Maps fully qualified class names to implementations. Populated explicitly
//! at program init; there is no runtime class discovery. An unknown name is
//! not an enqueue error — the job is created and ends in `error` when a
//! worker tries to dispatch it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::class::{JobClass, JobDefaults};

#[derive(Default)]
pub struct JobRegistry {
    classes: HashMap<String, Arc<dyn JobClass>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job class under its fully qualified name.
    ///
    /// The `author` attribute is mandatory and checked here, at load time.
    pub fn register(&mut self, name: impl Into<String>, class: Arc<dyn JobClass>) -> Result<()> {
        let name = name.into();
        if class.author().trim().is_empty() {
            bail!("job class [{}] has no author", name);
        }
        self.classes.insert(name, class);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobClass>> {
        self.classes.get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<&str> {
        self.classes.keys().map(String::as_str).collect()
    }

    /// Configuration defaults for `name`; global defaults when the class is
    /// unknown (the job will error at dispatch, not here).
    pub fn defaults(&self, name: &str) -> JobDefaults {
        match self.classes.get(name) {
            Some(class) => JobDefaults::from_class(class.as_ref()),
            None => JobDefaults::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::JobContext;
    use async_trait::async_trait;

    struct Named;

    #[async_trait]
    impl JobClass for Named {
        fn author(&self) -> &str {
            "qa"
        }

        fn attempts(&self) -> i64 {
            4
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<()> {
            Ok(())
        }
    }

    struct Anonymous;

    #[async_trait]
    impl JobClass for Anonymous {
        fn author(&self) -> &str {
            ""
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = JobRegistry::new();
        registry.register("jobs.Named", Arc::new(Named)).unwrap();

        assert!(registry.is_registered("jobs.Named"));
        assert!(!registry.is_registered("jobs.Other"));
        assert_eq!(registry.defaults("jobs.Named").attempts, 4);
    }

    #[test]
    fn register_rejects_missing_author() {
        let mut registry = JobRegistry::new();
        assert!(registry.register("jobs.Anonymous", Arc::new(Anonymous)).is_err());
    }

    #[test]
    fn unknown_names_get_global_defaults() {
        let registry = JobRegistry::new();
        let defaults = registry.defaults("jobs.Missing");
        assert_eq!(defaults.attempts, 1);
        assert_eq!(defaults.priority, 0);
    }
}
