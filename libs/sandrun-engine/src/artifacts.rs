// Names and lifetime of the files one execution leaves in a shared environment.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::environment::{Environment, Invocation};
use crate::lease::EnvironmentLease;
use crate::registry::LanguageRecipe;

/// Paths for one execution, derived from a fresh id rather than from the submitted code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub dir: String,
    pub name: String,
    pub source: String,
    pub pid_file: String,
    /// Directory owned by this execution alone, removed whole on release.
    /// Set for fixed entry points, whose file names would otherwise collide.
    pub scratch: Option<String>,
}

impl ArtifactNames {
    pub fn new(recipe: &LanguageRecipe, workdir: &str, execution_id: Uuid) -> Self {
        let base = workdir.trim_end_matches('/');
        let (dir, name, scratch) = match &recipe.entry_point {
            Some(entry) => {
                let dir = format!("{}/sandrun-{}", base, execution_id.simple());
                (dir.clone(), entry.clone(), Some(dir))
            }
            None => {
                let dir = if base.is_empty() { "/".to_string() } else { base.to_string() };
                (dir, format!("script_{}", execution_id.simple()), None)
            }
        };
        let source = format!("{}/{}.{}", dir.trim_end_matches('/'), name, recipe.file_extension);
        let pid_file = format!("{}/.sandrun-{}.pid", dir.trim_end_matches('/'), execution_id.simple());
        Self {
            dir,
            name,
            source,
            pid_file,
            scratch,
        }
    }

    /// Substitute `{dir}`, `{name}` and `{file}` in a recipe template
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{file}", &self.source)
            .replace("{dir}", &self.dir)
            .replace("{name}", &self.name)
    }

    pub fn invocation(&self, template: &str, limit: Duration) -> Invocation {
        Invocation {
            command: self.render(template),
            workdir: self.dir.clone(),
            pid_file: self.pid_file.clone(),
            limit,
        }
    }

    /// Every path the execution may create. A scratch directory stands for everything in it,
    /// including compile outputs the recipe cannot name up front.
    pub fn all_paths(&self, recipe: &LanguageRecipe) -> Vec<String> {
        let mut paths = match &self.scratch {
            Some(dir) => vec![dir.clone()],
            None => vec![self.source.clone(), self.pid_file.clone()],
        };
        paths.extend(recipe.artifacts.iter().map(|a| self.render(a)));
        paths
    }
}

/// What went wrong while releasing a scope. Never changes an execution's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseIssue {
    TerminateFailed(String),
    RemoveFailed(String),
    TimedOut(Duration),
}

/// Remote artifacts of one execution, released on every exit path.
///
/// The scope owns the environment lease and gives it up only once release has finished,
/// so the next holder never races our cleanup. Call `release` explicitly; if the scope is
/// dropped without it (the owning future was cancelled or panicked) release is spawned
/// onto the runtime, carrying the lease with it.
pub struct ArtifactScope {
    environment: Arc<dyn Environment>,
    lease: Option<EnvironmentLease>,
    environment_id: String,
    paths: Vec<String>,
    in_flight: Option<Invocation>,
    cleanup_timeout: Duration,
    released: bool,
}

impl ArtifactScope {
    pub fn new(
        environment: Arc<dyn Environment>,
        lease: EnvironmentLease,
        paths: Vec<String>,
        cleanup_timeout: Duration,
    ) -> Self {
        Self {
            environment,
            environment_id: lease.environment_id().to_string(),
            lease: Some(lease),
            paths,
            in_flight: None,
            cleanup_timeout,
            released: false,
        }
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    /// Record a command that may be running; release terminates it unless it settles first
    pub fn track(&mut self, invocation: Invocation) {
        self.in_flight = Some(invocation);
    }

    /// The tracked command exited on its own
    pub fn settle(&mut self) {
        self.in_flight = None;
    }

    /// Terminate anything still tracked and remove all artifacts, bounded by the cleanup
    /// timeout, then give the lease back. Problems are logged and returned, never escalated.
    pub async fn release(mut self) -> Vec<ReleaseIssue> {
        self.released = true;
        let lease = self.lease.take();
        let issues = release_artifacts(
            self.environment.clone(),
            self.environment_id.clone(),
            std::mem::take(&mut self.paths),
            self.in_flight.take(),
            self.cleanup_timeout,
        )
        .await;
        drop(lease);
        for issue in &issues {
            warn!(environment = %self.environment_id, issue = ?issue, "Artifact cleanup incomplete");
        }
        issues
    }
}

impl Drop for ArtifactScope {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Cannot await in Drop; hand the release to the runtime if there is one
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(environment = %self.environment_id, "Artifact scope dropped outside a runtime; artifacts leaked");
            return;
        };
        let environment = self.environment.clone();
        let environment_id = self.environment_id.clone();
        let lease = self.lease.take();
        let paths = std::mem::take(&mut self.paths);
        let in_flight = self.in_flight.take();
        let timeout = self.cleanup_timeout;
        handle.spawn(async move {
            let issues = release_artifacts(environment, environment_id.clone(), paths, in_flight, timeout).await;
            drop(lease);
            for issue in issues {
                warn!(environment = %environment_id, issue = ?issue, "Deferred artifact cleanup incomplete");
            }
        });
    }
}

async fn release_artifacts(
    environment: Arc<dyn Environment>,
    environment_id: String,
    paths: Vec<String>,
    in_flight: Option<Invocation>,
    timeout: Duration,
) -> Vec<ReleaseIssue> {
    let work = async {
        let mut issues = Vec::new();
        if let Some(invocation) = &in_flight {
            if let Err(e) = environment.terminate(&environment_id, invocation).await {
                issues.push(ReleaseIssue::TerminateFailed(e.to_string()));
            }
        }
        if let Err(e) = environment.remove(&environment_id, &paths).await {
            issues.push(ReleaseIssue::RemoveFailed(e.to_string()));
        }
        issues
    };

    match tokio::time::timeout(timeout, work).await {
        Ok(issues) => {
            if issues.is_empty() {
                debug!(environment = %environment_id, removed = paths.len(), "Artifacts released");
            }
            issues
        }
        Err(_) => vec![ReleaseIssue::TimedOut(timeout)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandrun_common::types::Language;

    #[test]
    fn test_unique_names_for_interpreted_languages() {
        let recipe = LanguageRecipe::builtin(Language::Python);
        let a = ArtifactNames::new(&recipe, "/tmp", Uuid::new_v4());
        let b = ArtifactNames::new(&recipe, "/tmp", Uuid::new_v4());
        assert_ne!(a.source, b.source);
        assert_ne!(a.pid_file, b.pid_file);
        assert!(a.source.starts_with("/tmp/script_"));
        assert!(a.source.ends_with(".py"));
    }

    #[test]
    fn test_fixed_entry_point_gets_its_own_directory() {
        let recipe = LanguageRecipe::builtin(Language::Java);
        let id = Uuid::new_v4();
        let names = ArtifactNames::new(&recipe, "/tmp/", id);
        let dir = format!("/tmp/sandrun-{}", id.simple());

        assert_eq!(names.scratch.as_deref(), Some(dir.as_str()));
        assert_eq!(names.source, format!("{}/Main.java", dir));
        assert_eq!(names.render("java -cp {dir} {name}"), format!("java -cp {} Main", dir));
        assert!(names.pid_file.starts_with(&dir));

        // Whatever javac emits lives under the directory, so removing it covers every class
        assert_eq!(names.all_paths(&recipe), vec![dir]);

        let other = ArtifactNames::new(&recipe, "/tmp", Uuid::new_v4());
        assert_ne!(names.source, other.source);
    }

    #[test]
    fn test_all_paths_cover_compile_outputs() {
        let recipe = LanguageRecipe::builtin(Language::Cpp);
        let names = ArtifactNames::new(&recipe, "/work", Uuid::new_v4());
        let paths = names.all_paths(&recipe);
        assert_eq!(paths.len(), 3);
        assert!(names.scratch.is_none());
        assert!(paths.contains(&names.source));
        assert!(paths.contains(&names.pid_file));
        assert!(paths.contains(&format!("/work/{}", names.name)));

        let compile = names.render(recipe.compile.as_deref().unwrap());
        assert_eq!(compile, format!("g++ -O2 -o /work/{0} /work/{0}.cpp", names.name));
    }

    #[test]
    fn test_root_workdir() {
        let recipe = LanguageRecipe::builtin(Language::Python);
        let names = ArtifactNames::new(&recipe, "/", Uuid::new_v4());
        assert!(names.source.starts_with("/script_"));
        assert_eq!(names.dir, "/");

        let java = ArtifactNames::new(&LanguageRecipe::builtin(Language::Java), "/", Uuid::new_v4());
        assert!(java.dir.starts_with("/sandrun-"));
    }

    /// Records when removal finishes; removal takes `remove_delay`
    struct SlowRemoval {
        remove_delay: Duration,
        removed: std::sync::Mutex<Vec<String>>,
        terminated: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Environment for SlowRemoval {
        async fn write_file(&self, _: &str, _: &str, _: &[u8]) -> Result<(), crate::EnvironmentError> {
            Ok(())
        }
        async fn run(&self, _: &str, _: &Invocation) -> Result<crate::CommandOutput, crate::EnvironmentError> {
            Ok(crate::CommandOutput::default())
        }
        async fn terminate(&self, _: &str, invocation: &Invocation) -> Result<(), crate::EnvironmentError> {
            self.terminated.lock().unwrap().push(invocation.pid_file.clone());
            Ok(())
        }
        async fn remove(&self, _: &str, paths: &[String]) -> Result<(), crate::EnvironmentError> {
            tokio::time::sleep(self.remove_delay).await;
            self.removed.lock().unwrap().extend(paths.iter().cloned());
            Ok(())
        }
        async fn probe(&self, _: &str) -> Result<(), crate::EnvironmentError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_scope_keeps_lease_until_cleanup_finishes() {
        let registry = crate::LanguageRegistry::builtin();
        let leases = crate::lease::LeaseTable::new(&registry);
        let recipe = registry.get(Language::Java).unwrap();
        let env = Arc::new(SlowRemoval {
            remove_delay: Duration::from_millis(75),
            removed: Default::default(),
            terminated: Default::default(),
        });

        let lease = leases.acquire(recipe).await.unwrap();
        let names = ArtifactNames::new(recipe, "/tmp", Uuid::new_v4());
        let mut scope = ArtifactScope::new(env.clone(), lease, names.all_paths(recipe), Duration::from_secs(1));
        scope.track(names.invocation("javac -d {dir} {file}", Duration::from_secs(5)));
        drop(scope);

        // Deferred cleanup is still removing files; the environment must not be handed out
        tokio::task::yield_now().await;
        assert_eq!(leases.available(Language::Java), 0);
        assert!(env.removed.lock().unwrap().is_empty());

        let next = leases.acquire(recipe).await.unwrap();
        assert_eq!(next.environment_id(), "leetcodecompiler-java-1");
        assert_eq!(*env.removed.lock().unwrap(), names.all_paths(recipe));
        assert_eq!(*env.terminated.lock().unwrap(), vec![names.pid_file.clone()]);
    }

    #[tokio::test]
    async fn test_settled_command_is_not_terminated() {
        let registry = crate::LanguageRegistry::builtin();
        let leases = crate::lease::LeaseTable::new(&registry);
        let recipe = registry.get(Language::Java).unwrap();
        let env = Arc::new(SlowRemoval {
            remove_delay: Duration::ZERO,
            removed: Default::default(),
            terminated: Default::default(),
        });

        let names = ArtifactNames::new(recipe, "/tmp", Uuid::new_v4());
        let mut scope = ArtifactScope::new(
            env.clone(),
            leases.acquire(recipe).await.unwrap(),
            names.all_paths(recipe),
            Duration::from_secs(1),
        );
        scope.track(names.invocation("java -cp {dir} {name}", Duration::from_secs(5)));
        scope.settle();

        assert!(scope.release().await.is_empty());
        assert!(env.terminated.lock().unwrap().is_empty());
        assert_eq!(leases.available(Language::Java), 1);
    }
}
