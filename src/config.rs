use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use url::Url;

use crate::dom::policy::AllowLists;
use crate::error::ConfigError;
use crate::js::loader::DEFAULT_MODULE_ORIGIN;
use crate::js::runtime::DEFAULT_MAX_JOBS_PER_DRAIN;
use crate::sandbox::DEFAULT_MARSHAL_DEPTH;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    allow_lists: AllowLists,
    marshal_depth: usize,
    memory_limit_bytes: Option<usize>,
    module_origin: String,
    max_jobs_per_drain: usize,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            allow_lists: AllowLists::default(),
            marshal_depth: DEFAULT_MARSHAL_DEPTH,
            memory_limit_bytes: None,
            module_origin: DEFAULT_MODULE_ORIGIN.to_string(),
            max_jobs_per_drain: DEFAULT_MAX_JOBS_PER_DRAIN,
        }
    }
}

/// Sandbox settings, read from YAML. Every key is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub allow_lists: AllowLists,
    pub marshal_depth: usize,
    pub memory_limit_bytes: Option<usize>,
    pub module_origin: Url,
    pub max_jobs_per_drain: usize,
}

impl SandboxConfig {
    /// Load from `config_path`, or defaults when the path is absent or
    /// names a file that does not exist.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let raw = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str::<Option<RawConfig>>(&contents)?.unwrap_or_default()
            }
            _ => RawConfig::default(),
        };

        Ok(Self {
            allow_lists: raw.allow_lists,
            marshal_depth: raw.marshal_depth,
            memory_limit_bytes: raw.memory_limit_bytes,
            module_origin: Url::parse(&raw.module_origin)?,
            max_jobs_per_drain: raw.max_jobs_per_drain,
        })
    }
}
