// Core data structures shared by the coordinator, the wire protocol and workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Set of capability flags a worker offers or a job requires (e.g. `cpu-exec`)
pub type Capabilities = BTreeSet<String>;

/// Longest `result_string` returned to producers, in bytes
pub const RESULT_STRING_LENGTH_LIMIT: usize = 1024;

/// Result code for jobs the coordinator gave up on (worker loss, executor crash)
pub const SYSTEM_ERROR_CODE: &str = "SE";

/// Result code for a successful job
pub const OK_CODE: &str = "OK";

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique job identifier
    JobId
);

uuid_id!(
    /// Opaque batch identifier handed back to producers
    BatchId
);

// ============================================================================
// Job State
// ============================================================================

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Done and failed are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Assigned or running on some worker
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// In-flight jobs may fall back to `Queued` when their worker is lost or
    /// the dispatch could not be handed to the connection. Terminal states
    /// are never left.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Assigned, Running)
                | (Assigned, Queued)
                | (Assigned, Failed)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

// ============================================================================
// Parameter Mapping
// ============================================================================

/// Job parameter mapping (the execution environment).
///
/// Keys are strings, values are arbitrary JSON. The coordinator only looks
/// at the keys its job-kind catalog recognizes plus the three outcome keys;
/// everything else travels to the executor and back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environ(BTreeMap<String, Value>);

impl Environ {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a string value (non-string values yield `None`)
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Get a numeric value; numeric strings such as `"87.5"` are accepted too
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Get a list of strings, ignoring non-string members
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        self.0.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }
}

impl FromIterator<(String, Value)> for Environ {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Job Specs and Outcomes
// ============================================================================

/// One job as submitted by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job-kind name, e.g. `compile` or `checker`
    pub kind: String,

    #[serde(default)]
    pub parameters: Environ,
}

impl JobSpec {
    pub fn new(kind: impl Into<String>, parameters: Environ) -> Self {
        Self {
            kind: kind.into(),
            parameters,
        }
    }
}

/// The triple the coordinator extracts from an executor's result mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub result_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_percentage: Option<f64>,
}

impl JobOutcome {
    /// Extract the outcome from a worker's result record.
    ///
    /// A successful result without a `result_code` counts as `OK`; a failed
    /// one is a system error carrying the worker's `error` text if present.
    pub fn from_result(success: bool, parameters: &Environ) -> Self {
        let result_code = match parameters.get_str("result_code") {
            Some(code) if success => code.to_string(),
            _ if success => OK_CODE.to_string(),
            _ => SYSTEM_ERROR_CODE.to_string(),
        };

        let result_string = parameters
            .get_str("result_string")
            .or_else(|| (!success).then(|| parameters.get_str("error")).flatten())
            .map(limit_length);

        let result_percentage = parameters
            .get_f64("result_percentage")
            .map(|p| p.clamp(0.0, 100.0));

        Self {
            result_code,
            result_string,
            result_percentage,
        }
    }

    /// Outcome for a job abandoned after exhausting its retries
    pub fn permanent_failure(attempts: u32) -> Self {
        Self {
            result_code: SYSTEM_ERROR_CODE.to_string(),
            result_string: Some(format!("worker lost during execution ({attempts} attempts)")),
            result_percentage: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result_code == OK_CODE
    }
}

/// Truncate a result string to [`RESULT_STRING_LENGTH_LIMIT`] bytes, marking the cut
fn limit_length(s: &str) -> String {
    if s.len() <= RESULT_STRING_LENGTH_LIMIT {
        return s.to_string();
    }
    const SUFFIX: &str = "[...]";
    let mut end = RESULT_STRING_LENGTH_LIMIT - SUFFIX.len();
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{SUFFIX}", &s[..end])
}

// ============================================================================
// Reports
// ============================================================================

/// Final state of one job inside a batch report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub kind: String,
    pub state: JobState,
    pub retries: u32,
    pub result_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_string: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_percentage: Option<f64>,

    /// The executor's full output mapping (empty for permanent failures)
    #[serde(default)]
    pub parameters: Environ,
}

/// Aggregated result of a finished batch, jobs in submission order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    /// True when every job finished with `OK`
    pub fn all_ok(&self) -> bool {
        self.jobs.iter().all(|j| j.result_code == OK_CODE)
    }

    pub fn failed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .count()
    }
}

/// What a producer sees when polling a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchStatus {
    Pending { remaining: usize },
    Finished { report: BatchReport },
    Cancelled,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Batch cancelled; `removed` queued jobs were dropped, `in_flight` keep running
    Cancelled { removed: usize, in_flight: usize },
    /// Batch already resolved, nothing to cancel
    AlreadyFinished,
}
