//! Job executors and the registry that maps job kinds to them

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::models::{Environ, OK_CODE};
use crate::protocol::{Dispatch, JobResult};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("no executor for job kind '{0}'")]
    UnknownKind(String),

    #[error("execution failed: {0}")]
    Failed(String),
}

/// Runs one kind of job.
///
/// Takes the job's parameter mapping and returns the result mapping,
/// which should carry `result_code` and may carry `result_string` and
/// `result_percentage`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Job kind this executor handles
    fn kind(&self) -> &str;

    async fn execute(&self, parameters: Environ) -> Result<Environ, ExecutorError>;
}

/// Liveness check: echoes `ping` back as `pong`
#[derive(Debug, Default, Clone, Copy)]
pub struct PingExecutor;

#[async_trait]
impl Executor for PingExecutor {
    fn kind(&self) -> &str {
        "ping"
    }

    async fn execute(&self, mut parameters: Environ) -> Result<Environ, ExecutorError> {
        let ping = parameters
            .get("ping")
            .cloned()
            .ok_or_else(|| ExecutorError::MissingParameter("ping".to_string()))?;
        parameters.insert("pong", ping);
        parameters.insert("result_code", OK_CODE);
        Ok(parameters)
    }
}

/// Executors available on a worker, by job kind
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the executors shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PingExecutor));
        registry
    }

    /// Add or replace the executor for its kind
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.kind().to_string(), executor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Run a dispatched job and build its result. Never fails: missing
    /// executors, executor errors and panics become `success = false`
    /// with an `error` field.
    pub async fn run(&self, dispatch: Dispatch) -> JobResult {
        let Dispatch {
            job_id,
            job_kind,
            parameters,
        } = dispatch;

        let outcome = match self.get(&job_kind) {
            Some(executor) => {
                let input = parameters.clone();
                match tokio::spawn(async move { executor.execute(input).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(ExecutorError::Failed(format!("executor task failed: {e}"))),
                }
            }
            None => Err(ExecutorError::UnknownKind(job_kind.clone())),
        };

        match outcome {
            Ok(output) => JobResult {
                job_id,
                success: true,
                parameters: output,
            },
            Err(e) => {
                warn!(job_id = %job_id, kind = %job_kind, error = %e, "Job failed on worker");
                JobResult {
                    job_id,
                    success: false,
                    parameters: parameters.with("error", e.to_string()),
                }
            }
        }
    }
}
