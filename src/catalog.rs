//! Job-kind catalog and submission-time validation
//!
//! The catalog is the versioned list of job kinds the coordinator accepts,
//! with the parameter keys each kind must carry and the worker capabilities
//! it needs. Specs are checked here before a batch gets anywhere near the
//! queue; a batch with a single malformed spec is rejected as a whole.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::{Capabilities, JobSpec};

/// Version of the recognized-keys table below
pub const CATALOG_VERSION: u32 = 1;

/// Optional per-job key naming extra capabilities the worker must have
pub const REQUIRED_CAPABILITIES_KEY: &str = "required_capabilities";

/// Capability advertised by workers trusted with on-cpu timing
pub const CPU_EXEC_CAPABILITY: &str = "cpu-exec";

/// Capability advertised by workers allowed to run unsandboxed jobs
pub const UNSAFE_EXEC_CAPABILITY: &str = "unsafe-exec";

/// Description of one job kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKindSpec {
    pub name: String,
    pub required_keys: Vec<String>,
    pub capabilities: Capabilities,
}

impl JobKindSpec {
    pub fn new(name: &str, required_keys: &[&str], capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            required_keys: required_keys.iter().map(|k| k.to_string()).collect(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Submission validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("batch contains no jobs")]
    EmptyBatch,

    #[error("job #{index}: unknown job kind '{kind}'")]
    UnknownKind { index: usize, kind: String },

    #[error("job #{index} ({kind}): missing required parameters: {}", missing.join(", "))]
    MissingKeys {
        index: usize,
        kind: String,
        missing: Vec<String>,
    },

    #[error("job #{index}: '{key}' must be a list of strings")]
    InvalidCapabilities { index: usize, key: String },
}

/// Registry of accepted job kinds
#[derive(Debug, Clone)]
pub struct JobKindCatalog {
    kinds: BTreeMap<String, JobKindSpec>,
}

impl Default for JobKindCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl JobKindCatalog {
    /// Empty catalog; every kind must be registered
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// The standard judging kinds
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for spec in [
            JobKindSpec::new("ping", &[], &[]),
            JobKindSpec::new("compile", &["source_file", "out_file"], &[]),
            JobKindSpec::new("exec", &["exe_file", "in_file"], &[]),
            JobKindSpec::new("vcpu-exec", &["exe_file", "in_file"], &[]),
            JobKindSpec::new("cpu-exec", &["exe_file", "in_file"], &[CPU_EXEC_CAPABILITY]),
            JobKindSpec::new(
                "unsafe-exec",
                &["exe_file", "in_file"],
                &[UNSAFE_EXEC_CAPABILITY],
            ),
            JobKindSpec::new("checker", &["out_file", "hint_file"], &[]),
            JobKindSpec::new("ingen", &["exe_file"], &[]),
            JobKindSpec::new("inwer", &["exe_file", "in_file"], &[]),
        ] {
            catalog.register(spec);
        }
        catalog
    }

    /// Add or replace a kind
    pub fn register(&mut self, spec: JobKindSpec) {
        self.kinds.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, kind: &str) -> Option<&JobKindSpec> {
        self.kinds.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &JobKindSpec> {
        self.kinds.values()
    }

    /// Validate one spec, returning the capabilities a worker needs to run it
    pub fn validate(&self, index: usize, spec: &JobSpec) -> Result<Capabilities, ValidationError> {
        let kind = self
            .kinds
            .get(&spec.kind)
            .ok_or_else(|| ValidationError::UnknownKind {
                index,
                kind: spec.kind.clone(),
            })?;

        let missing: Vec<String> = kind
            .required_keys
            .iter()
            .filter(|key| !spec.parameters.contains_key(key))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(ValidationError::MissingKeys {
                index,
                kind: spec.kind.clone(),
                missing,
            });
        }

        let mut capabilities = kind.capabilities.clone();
        if let Some(value) = spec.parameters.get(REQUIRED_CAPABILITIES_KEY) {
            let extra = value
                .as_array()
                .filter(|items| items.iter().all(|v| v.is_string()))
                .ok_or_else(|| ValidationError::InvalidCapabilities {
                    index,
                    key: REQUIRED_CAPABILITIES_KEY.to_string(),
                })?;
            capabilities.extend(extra.iter().filter_map(|v| v.as_str().map(str::to_string)));
        }

        Ok(capabilities)
    }

    /// Validate a whole batch; the first bad spec rejects it
    pub fn validate_batch(&self, specs: &[JobSpec]) -> Result<Vec<Capabilities>, ValidationError> {
        if specs.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }

        specs
            .iter()
            .enumerate()
            .map(|(index, spec)| self.validate(index, spec))
            .collect()
    }
}
