//! Builder settings.
//!
//! Settings are plain data loaded from JSON (or defaulted) and shared through
//! a [`SettingsHandle`]. Consumers call [`SettingsHandle::load`] every time
//! they need a value, so an [`SettingsHandle::update`] takes effect on the
//! next admission or selection without restarting the builder.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PartIndexError, Result};

/// Configuration for the vector index builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    /// Maximum number of concurrent slow-mode builds.
    pub slow_mode_budget: usize,

    /// Maximum number of concurrent fast-mode builds.
    pub fast_mode_budget: usize,

    /// Parts with fewer rows than this are built in slow mode.
    pub max_rows_for_slow_mode_single_vector_index_build: u64,

    /// Parts with fewer rows than this are never indexed.
    pub min_rows_to_build_vector_index: u64,

    /// How many times a built index may be re-targeted to a mutated
    /// successor part before the build reports a retry.
    pub max_install_retries: usize,

    /// Initial backoff after a failed build, in milliseconds.
    pub retry_backoff_ms: u64,

    /// Upper bound of the exponential failure backoff, in milliseconds.
    pub max_retry_backoff_ms: u64,

    /// Failed builds of one (part, index) pair after which the scheduler
    /// gives up on it.
    pub max_build_failures: u32,

    /// Number of background worker threads.
    pub worker_threads: usize,

    /// Sleep between polls when there is nothing to build, in milliseconds.
    pub idle_sleep_ms: u64,

    /// Name of the scratch directory under the table root.
    pub scratch_dir_name: String,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        let workers = num_cpus::get().clamp(1, 4);
        BuilderSettings {
            slow_mode_budget: 1,
            fast_mode_budget: workers,
            max_rows_for_slow_mode_single_vector_index_build: 10_000,
            min_rows_to_build_vector_index: 0,
            max_install_retries: 3,
            retry_backoff_ms: 500,
            max_retry_backoff_ms: 60_000,
            max_build_failures: 5,
            worker_threads: workers,
            idle_sleep_ms: 200,
            scratch_dir_name: "tmp_vector_index".to_string(),
        }
    }
}

impl BuilderSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let settings: BuilderSettings = serde_json::from_slice(&bytes)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for values the builder cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(PartIndexError::invalid_config(
                "worker_threads must be at least 1",
            ));
        }
        if self.scratch_dir_name.is_empty() || self.scratch_dir_name.contains('/') {
            return Err(PartIndexError::invalid_config(format!(
                "invalid scratch_dir_name: {:?}",
                self.scratch_dir_name
            )));
        }
        if self.retry_backoff_ms > self.max_retry_backoff_ms {
            return Err(PartIndexError::invalid_config(
                "retry_backoff_ms exceeds max_retry_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Shared, live-reloadable settings.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<BuilderSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: BuilderSettings) -> Self {
        SettingsHandle {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// Current settings snapshot.
    pub fn load(&self) -> Arc<BuilderSettings> {
        self.inner.read().clone()
    }

    /// Replace the settings. Readers holding an older snapshot keep it.
    pub fn update(&self, settings: BuilderSettings) -> Result<()> {
        settings.validate()?;
        *self.inner.write() = Arc::new(settings);
        Ok(())
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(BuilderSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"slow_mode_budget": 3, "idle_sleep_ms": 10}}"#).unwrap();

        let settings = BuilderSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.slow_mode_budget, 3);
        assert_eq!(settings.idle_sleep_ms, 10);
        assert_eq!(
            settings.scratch_dir_name,
            BuilderSettings::default().scratch_dir_name
        );
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let settings = BuilderSettings {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_handle_update_is_visible() {
        let handle = SettingsHandle::default();
        let before = handle.load();

        let mut next = (*before).clone();
        next.fast_mode_budget = 42;
        handle.update(next).unwrap();

        assert_eq!(handle.load().fast_mode_budget, 42);
        assert_ne!(before.fast_mode_budget, 42);
    }
}
