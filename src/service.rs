//! Request-level analysis flow: fingerprint, cache lookup, run on miss,
//! populate on success.

use std::sync::Arc;

use thiserror::Error;

use crate::analysis::{AnalysisDefinition, ParameterError, ParameterValues};
use crate::cache::{CacheEngine, Fingerprint};
use crate::models::OutputFiles;
use crate::runner::{ExecutionEngine, ExecutionOutcome, ExecutionRequest, ExecutionResult, RunnerError};
use crate::scheduler::{PoolError, WorkerPool};
use crate::upload::StoredArtifact;

/// Errors from running an analysis.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A request parameter was malformed or out of range.
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    /// The tool ran but did not succeed.
    #[error("{}", .0.stderr)]
    Execution(Box<ExecutionResult>),

    /// The tool succeeded without writing the primary output.
    #[error("no output generated")]
    NoOutput { stdout: String },
}

impl ServiceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(result) if result.outcome == ExecutionOutcome::TimedOut)
    }

    /// Captured tool output, when there is any.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::Execution(result) => Some(&result.stdout),
            Self::NoOutput { stdout } => Some(stdout),
            _ => None,
        }
    }
}

/// Outputs of one analysis, fresh or from the cache.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub fingerprint: Fingerprint,
    pub outputs: Arc<OutputFiles>,
    pub cached: bool,
}

/// Composes the result cache, the execution engine and, optionally, the
/// worker pool.
pub struct AnalysisService {
    cache: Arc<CacheEngine>,
    engine: Arc<ExecutionEngine>,
    pool: Option<Arc<WorkerPool>>,
}

impl AnalysisService {
    /// Without a pool, runs execute on the calling task.
    pub fn new(
        cache: Arc<CacheEngine>,
        engine: Arc<ExecutionEngine>,
        pool: Option<Arc<WorkerPool>>,
    ) -> Self {
        Self {
            cache,
            engine,
            pool,
        }
    }

    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Run `analysis` against `artifact` with the request's parameter
    /// values, serving from the cache when the same content was analysed
    /// with the same resolved arguments before.
    ///
    /// Only successful runs that produced the primary output are cached.
    pub async fn analyze(
        &self,
        artifact: &StoredArtifact,
        analysis: &AnalysisDefinition,
        params: &ParameterValues,
    ) -> Result<AnalysisOutcome, ServiceError> {
        let args = analysis.resolve_args(params)?;
        let fingerprint = Fingerprint::compute(artifact.digest(), &args);
        let primary = analysis.primary_output();

        if let Some(outputs) = self.cache.get(&fingerprint) {
            if outputs.contains_key(primary) {
                tracing::info!(analysis = %analysis.name, %fingerprint, "cache hit");
                return Ok(AnalysisOutcome {
                    fingerprint,
                    outputs,
                    cached: true,
                });
            }
        }

        let request = ExecutionRequest {
            artifact: artifact.path().to_path_buf(),
            args,
            expected_outputs: analysis.outputs.clone(),
        };
        let result = self.execute(&analysis.name, &fingerprint, request).await?;

        if !result.success {
            return Err(ServiceError::Execution(Box::new(result)));
        }
        if !result.output_files.contains_key(primary) {
            tracing::warn!(analysis = %analysis.name, %fingerprint, "tool produced no primary output");
            return Err(ServiceError::NoOutput {
                stdout: result.stdout,
            });
        }

        let outputs = Arc::new(result.output_files);
        self.cache.put(fingerprint, Arc::clone(&outputs));
        tracing::info!(
            analysis = %analysis.name,
            %fingerprint,
            duration_ms = result.duration.as_millis() as u64,
            "analysis completed"
        );

        Ok(AnalysisOutcome {
            fingerprint,
            outputs,
            cached: false,
        })
    }

    async fn execute(
        &self,
        analysis: &str,
        fingerprint: &Fingerprint,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ServiceError> {
        match &self.pool {
            Some(pool) => {
                let engine = Arc::clone(&self.engine);
                let id = format!("{analysis}-{}", &fingerprint.to_hex()[..12]);
                let result = pool.run(id, async move { engine.run(&request).await }).await??;
                Ok(result)
            }
            None => Ok(self.engine.run(&request).await?),
        }
    }
}
