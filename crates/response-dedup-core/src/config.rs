use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{DedupError, PointerPolicy};

const DEFAULT_CHUNK_SIZE: usize = 500;
const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;
const DEFAULT_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ModuleConfig {
    /// Question codes whose presence alone does not make a submission complete.
    #[serde(default)]
    pub profile_update_codes: BTreeSet<String>,
    #[serde(default)]
    pub require_profile_update_codes: bool,
}

impl ModuleConfig {
    #[must_use]
    pub fn with_profile_update_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            profile_update_codes: codes.into_iter().map(Into::into).collect(),
            require_profile_update_codes: false,
        }
    }

    #[must_use]
    pub fn is_profile_update_code(&self, code: &str) -> bool {
        self.profile_update_codes.contains(code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default)]
    pub pointer_policy: PointerPolicy,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_write_attempts() -> u32 {
    DEFAULT_MAX_WRITE_ATTEMPTS
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
            pointer_policy: PointerPolicy::default(),
            workers: DEFAULT_WORKERS,
            modules: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_module(mut self, module_id: impl Into<String>, module: ModuleConfig) -> Self {
        self.modules.insert(module_id.into(), module);
        self
    }

    /// Check the invocation-wide settings before any work starts.
    ///
    /// # Errors
    /// Returns [`DedupError::Config`] for zero batch sizes, attempts or workers, blank
    /// module ids, and modules that require a profile-update code set but have none.
    pub fn validate(&self) -> Result<(), DedupError> {
        if self.chunk_size == 0 {
            return Err(DedupError::Config("chunk_size MUST be >= 1".to_string()));
        }
        if self.max_write_attempts == 0 {
            return Err(DedupError::Config("max_write_attempts MUST be >= 1".to_string()));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(DedupError::Config(format!("workers MUST be in 1..={MAX_WORKERS}")));
        }

        for (module_id, module) in &self.modules {
            if module_id.trim().is_empty() {
                return Err(DedupError::Config("module ids MUST be non-empty".to_string()));
            }
            if module.require_profile_update_codes && module.profile_update_codes.is_empty() {
                return Err(DedupError::Config(format!(
                    "module {module_id} requires a non-empty profile_update_codes set"
                )));
            }
        }

        Ok(())
    }

    /// Look up the settings of one survey module.
    ///
    /// # Errors
    /// Returns [`DedupError::Config`] when the module is not configured.
    pub fn module(&self, module_id: &str) -> Result<&ModuleConfig, DedupError> {
        self.modules
            .get(module_id)
            .ok_or_else(|| DedupError::Config(format!("unknown module: {module_id}")))
    }
}
