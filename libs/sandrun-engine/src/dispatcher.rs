/// Execution Dispatcher
///
/// Runs one (code, language) pair to completion inside a shared environment:
/// 1. Resolve the recipe (rejections never touch an environment)
/// 2. Lease an environment and derive unique artifact names
/// 3. Write the source, compile if the recipe says so, run
/// 4. Release every artifact, whatever happened above, and only then the lease
///
/// Compile and run share one wall-clock budget. When it runs out the remote process
/// group is killed before the artifacts are removed.
use async_trait::async_trait;
use sandrun_common::config::Config;
use sandrun_common::types::{ExecutionResult, ExecutionStatus, FailureKind, Language};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactNames, ArtifactScope};
use crate::environment::{CommandOutput, Environment, Invocation};
use crate::error::DispatchError;
use crate::lease::LeaseTable;
use crate::registry::{LanguageRecipe, LanguageRegistry};

/// Largest accepted source, in bytes. The encoded source travels as one exec argument.
pub const MAX_SOURCE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub execution_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub workdir: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            execution_timeout: config.execution_timeout,
            cleanup_timeout: config.cleanup_timeout,
            workdir: config.workdir.clone(),
        }
    }
}

/// Anything that can turn submitted code into an `ExecutionResult`.
/// The worker pool and the API depend on this rather than on `Dispatcher` directly.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Check a request without executing it
    fn validate(&self, code: &str, language: &str) -> Result<Language, DispatchError>;

    async fn run_code(&self, code: &str, language: &str) -> Result<ExecutionResult, DispatchError>;

    fn supported_languages(&self) -> Vec<&'static str>;
}

/// How far one execution got
enum Outcome {
    Ran(CommandOutput),
    CompileFailed(CommandOutput),
    TimedOut,
    Infrastructure(String),
}

pub struct Dispatcher {
    registry: Arc<LanguageRegistry>,
    environment: Arc<dyn Environment>,
    leases: LeaseTable,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(registry: Arc<LanguageRegistry>, environment: Arc<dyn Environment>, settings: DispatchSettings) -> Self {
        let leases = LeaseTable::new(&registry);
        Self {
            registry,
            environment,
            leases,
            settings,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Reject malformed or unsupported requests up front
    pub fn validate_request(&self, code: &str, language: &str) -> Result<&LanguageRecipe, DispatchError> {
        if code.trim().is_empty() || language.trim().is_empty() {
            return Err(DispatchError::EmptySource);
        }
        if code.len() > MAX_SOURCE_BYTES {
            return Err(DispatchError::SourceTooLarge {
                limit: MAX_SOURCE_BYTES,
                actual: code.len(),
            });
        }
        self.registry.resolve(language)
    }

    /// Compile and run `code`. `Err` only for requests refused before any environment call;
    /// everything that happens afterwards is reported in the returned result.
    #[tracing::instrument(skip(self, code), fields(code_bytes = code.len()))]
    pub async fn execute(&self, code: &str, language: &str) -> Result<ExecutionResult, DispatchError> {
        let recipe = self.validate_request(code, language)?;
        Ok(self.execute_recipe(recipe, code).await)
    }

    async fn execute_recipe(&self, recipe: &LanguageRecipe, code: &str) -> ExecutionResult {
        let execution_id = Uuid::new_v4();
        let started = Instant::now();

        let Some(lease) = self.leases.acquire(recipe).await else {
            error!(language = %recipe.language, "No environment available");
            return finish(
                Outcome::Infrastructure(format!("No environment configured for {}", recipe.language)),
                execution_id,
                None,
                started,
                self.settings.execution_timeout,
            );
        };
        let environment_id = lease.environment_id().to_string();

        // Waiting for an exclusive lease does not eat into the budget
        let deadline = Instant::now() + self.settings.execution_timeout;
        let names = ArtifactNames::new(recipe, &self.settings.workdir, execution_id);
        // The scope holds the lease until cleanup is done, even if this future is dropped
        let mut scope = ArtifactScope::new(
            self.environment.clone(),
            lease,
            names.all_paths(recipe),
            self.settings.cleanup_timeout,
        );

        debug!(
            execution_id = %execution_id,
            language = %recipe.language,
            environment = %environment_id,
            source = %names.source,
            "Dispatching execution"
        );

        let outcome = self
            .compile_and_run(recipe, code, &names, &environment_id, deadline, &mut scope)
            .await;

        scope.release().await;

        finish(
            outcome,
            execution_id,
            Some(environment_id),
            started,
            self.settings.execution_timeout,
        )
    }

    async fn compile_and_run(
        &self,
        recipe: &LanguageRecipe,
        code: &str,
        names: &ArtifactNames,
        environment_id: &str,
        deadline: Instant,
        scope: &mut ArtifactScope,
    ) -> Outcome {
        match tokio::time::timeout_at(
            deadline,
            self.environment.write_file(environment_id, &names.source, code.as_bytes()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Outcome::Infrastructure(e.to_string()),
            Err(_) => return Outcome::TimedOut,
        }

        if let Some(compile) = &recipe.compile {
            let invocation = names.invocation(compile, remaining(deadline));
            match self.step(environment_id, invocation, deadline, scope).await {
                Ok(output) if output.success() => {}
                Ok(output) => return Outcome::CompileFailed(output),
                Err(outcome) => return outcome,
            }
        }

        if remaining(deadline).is_zero() {
            return Outcome::TimedOut;
        }
        let invocation = names.invocation(&recipe.run, remaining(deadline));
        match self.step(environment_id, invocation, deadline, scope).await {
            Ok(output) => Outcome::Ran(output),
            Err(outcome) => outcome,
        }
    }

    /// Run one command against the deadline. The command stays tracked by the scope until it
    /// exits on its own, so a timeout or a cancelled caller leaves it for release to terminate.
    async fn step(
        &self,
        environment_id: &str,
        invocation: Invocation,
        deadline: Instant,
        scope: &mut ArtifactScope,
    ) -> Result<CommandOutput, Outcome> {
        scope.track(invocation.clone());
        match tokio::time::timeout_at(deadline, self.environment.run(environment_id, &invocation)).await {
            Ok(Ok(output)) if output.exit_code.is_none() => Err(Outcome::Infrastructure(format!(
                "Environment {} reported no exit status",
                environment_id
            ))),
            Ok(Ok(output)) => {
                scope.settle();
                Ok(output)
            }
            Ok(Err(e)) => Err(Outcome::Infrastructure(e.to_string())),
            Err(_) => Err(Outcome::TimedOut),
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn finish(
    outcome: Outcome,
    execution_id: Uuid,
    environment_used: Option<String>,
    started: Instant,
    budget: Duration,
) -> ExecutionResult {
    let execution_time = started.elapsed().as_secs_f64();
    let mut result = ExecutionResult {
        status: ExecutionStatus::Success,
        output: None,
        error: None,
        exit_code: None,
        failure: None,
        execution_time,
        execution_id,
        environment_used,
    };

    match outcome {
        Outcome::Ran(output) if output.success() => {
            result.output = Some(output.stdout.trim().to_string());
            result.error = non_empty(&output.stderr);
            result.exit_code = output.exit_code;
        }
        Outcome::Ran(output) => {
            let code = output.exit_code.unwrap_or(-1);
            result.status = ExecutionStatus::Failure;
            result.failure = Some(FailureKind::RuntimeFailure);
            result.output = Some(output.stdout.trim().to_string());
            result.error = Some(non_empty(&output.stderr).unwrap_or_else(|| format!("process exited with code {}", code)));
            result.exit_code = output.exit_code;
        }
        Outcome::CompileFailed(output) => {
            let code = output.exit_code.unwrap_or(-1);
            result.status = ExecutionStatus::Failure;
            result.failure = Some(FailureKind::CompileFailure);
            result.error = Some(
                non_empty(&output.stderr)
                    .or_else(|| non_empty(&output.stdout))
                    .unwrap_or_else(|| format!("compilation failed with code {}", code)),
            );
            result.exit_code = output.exit_code;
        }
        Outcome::TimedOut => {
            result.status = ExecutionStatus::Timeout;
            result.failure = Some(FailureKind::TimedOut);
            result.error = Some(format!("Execution timed out after {}s", budget.as_secs_f64()));
        }
        Outcome::Infrastructure(reason) => {
            result.status = ExecutionStatus::Error;
            result.failure = Some(FailureKind::Infrastructure);
            result.error = Some(reason);
        }
    }

    match result.status {
        ExecutionStatus::Success | ExecutionStatus::Failure => info!(
            execution_id = %result.execution_id,
            status = ?result.status,
            failure = ?result.failure,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms(),
            "Execution finished"
        ),
        ExecutionStatus::Timeout => warn!(
            execution_id = %result.execution_id,
            environment = ?result.environment_used,
            duration_ms = result.duration_ms(),
            "Execution timed out"
        ),
        ExecutionStatus::Error => error!(
            execution_id = %result.execution_id,
            environment = ?result.environment_used,
            error = ?result.error,
            "Execution failed on infrastructure"
        ),
    }

    result
}

#[async_trait]
impl CodeRunner for Dispatcher {
    fn validate(&self, code: &str, language: &str) -> Result<Language, DispatchError> {
        self.validate_request(code, language).map(|recipe| recipe.language)
    }

    async fn run_code(&self, code: &str, language: &str) -> Result<ExecutionResult, DispatchError> {
        self.execute(code, language).await
    }

    fn supported_languages(&self) -> Vec<&'static str> {
        self.registry.supported_names()
    }
}
