/// Docker-backed environments
///
/// Each environment is an already running container, addressed by name. Every operation
/// is a `docker exec` issued through Bollard; nothing here creates or removes containers.
///
/// Source code crosses into the container base64-encoded, so quotes, newlines and shell
/// metacharacters in user code never reach a shell unescaped.
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::debug;

use crate::environment::{CommandOutput, Environment, Invocation};
use crate::error::EnvironmentError;

pub struct DockerEnvironment {
    docker: Docker,
}

impl DockerEnvironment {
    pub fn connect() -> Result<Self, EnvironmentError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| EnvironmentError::Unreachable {
            environment: "docker".to_string(),
            reason: format!("Failed to connect to Docker daemon: {}", e),
        })?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Run `cmd` in the container and collect both streams plus the exit code
    async fn exec(
        &self,
        environment_id: &str,
        cmd: Vec<String>,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, EnvironmentError> {
        let unreachable = |e: bollard::errors::Error| EnvironmentError::Unreachable {
            environment: environment_id.to_string(),
            reason: e.to_string(),
        };

        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: workdir.map(str::to_string),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(environment_id, exec_config)
            .await
            .map_err(unreachable)?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let started = self
            .docker
            .start_exec(&exec.id, Some(start_config))
            .await
            .map_err(unreachable)?;

        // Bytes are decoded once at the end so multi-byte characters split across frames survive
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(msg) = output.next().await {
                match msg.map_err(unreachable)? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        } else {
            return Err(EnvironmentError::Unreachable {
                environment: environment_id.to_string(),
                reason: "exec did not attach".to_string(),
            });
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(unreachable)?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspect.exit_code,
        })
    }

    async fn shell(
        &self,
        environment_id: &str,
        operation: &'static str,
        script: String,
        workdir: Option<&str>,
    ) -> Result<CommandOutput, EnvironmentError> {
        let output = self
            .exec(environment_id, vec!["sh".to_string(), "-c".to_string(), script], workdir)
            .await?;
        if output.exit_code.is_none() {
            return Err(EnvironmentError::Rejected {
                environment: environment_id.to_string(),
                operation,
                reason: "no exit status reported".to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    async fn write_file(&self, environment_id: &str, path: &str, contents: &[u8]) -> Result<(), EnvironmentError> {
        let encoded = general_purpose::STANDARD.encode(contents);
        let output = self
            .shell(environment_id, "write", write_script(&encoded, path), None)
            .await?;
        if !output.success() {
            return Err(EnvironmentError::Rejected {
                environment: environment_id.to_string(),
                operation: "write",
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn run(&self, environment_id: &str, invocation: &Invocation) -> Result<CommandOutput, EnvironmentError> {
        debug!(environment = environment_id, command = %invocation.command, "docker exec");
        self.exec(
            environment_id,
            vec!["sh".to_string(), "-c".to_string(), run_script(invocation)],
            Some(&invocation.workdir),
        )
        .await
    }

    async fn terminate(&self, environment_id: &str, invocation: &Invocation) -> Result<(), EnvironmentError> {
        self.shell(environment_id, "terminate", terminate_script(&invocation.pid_file), None)
            .await
            .map(|_| ())
    }

    async fn remove(&self, environment_id: &str, paths: &[String]) -> Result<(), EnvironmentError> {
        if paths.is_empty() {
            return Ok(());
        }
        let output = self
            .shell(environment_id, "remove", remove_script(paths)?, None)
            .await?;
        if !output.success() {
            return Err(EnvironmentError::Rejected {
                environment: environment_id.to_string(),
                operation: "remove",
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn probe(&self, environment_id: &str) -> Result<(), EnvironmentError> {
        let inspect = self
            .docker
            .inspect_container(environment_id, None)
            .await
            .map_err(|e| EnvironmentError::Unreachable {
                environment: environment_id.to_string(),
                reason: e.to_string(),
            })?;

        let running = inspect.state.and_then(|s| s.running).unwrap_or(false);
        if !running {
            return Err(EnvironmentError::Unreachable {
                environment: environment_id.to_string(),
                reason: "container is not running".to_string(),
            });
        }
        Ok(())
    }
}

/// Single-quote `s` for POSIX sh
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote a path but leave its `*` wildcards live
fn quote_pattern(path: &str) -> String {
    path.split('*').map(shell_quote).collect::<Vec<_>>().join("*")
}

/// Decode base64 text into `path`, creating its directory first.
/// The alphabet contains no shell metacharacters.
fn write_script(encoded: &str, path: &str) -> String {
    let parent = match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    };
    format!(
        "mkdir -p {} && printf '%s' '{}' | base64 -d > {}",
        shell_quote(parent),
        encoded,
        shell_quote(path)
    )
}

/// Remove files and directories. Refuses anything that could name the filesystem root.
fn remove_script(paths: &[String]) -> Result<String, EnvironmentError> {
    if let Some(bad) = paths.iter().find(|p| p.trim_matches(['/', '*', ' ']).is_empty()) {
        return Err(EnvironmentError::Rejected {
            environment: "docker".to_string(),
            operation: "remove",
            reason: format!("refusing to remove {:?}", bad),
        });
    }
    let quoted: Vec<String> = paths.iter().map(|p| quote_pattern(p)).collect();
    Ok(format!("rm -rf -- {}", quoted.join(" ")))
}

/// Record our pid, then become `timeout`, which leads its own process group.
/// Killing that group on expiry takes the user program down with it.
fn run_script(invocation: &Invocation) -> String {
    let backstop = invocation.limit.as_secs() + 1;
    format!(
        "echo $$ > {pid} && exec timeout -s KILL {secs} sh -c {cmd}",
        pid = shell_quote(&invocation.pid_file),
        secs = backstop,
        cmd = shell_quote(&invocation.command),
    )
}

fn terminate_script(pid_file: &str) -> String {
    let pid_file = shell_quote(pid_file);
    format!(
        "if [ -f {pf} ]; then pid=$(cat {pf}); kill -KILL -- -\"$pid\" 2>/dev/null || kill -KILL \"$pid\" 2>/dev/null; fi; true",
        pf = pid_file
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_write_script_never_embeds_raw_code() {
        let code = "print('$(rm -rf /)')\n`whoami`";
        let encoded = general_purpose::STANDARD.encode(code);
        let script = write_script(&encoded, "/tmp/script_1.py");
        assert!(!script.contains("rm -rf"));
        assert!(!script.contains('`'));
        assert!(script.ends_with("base64 -d > '/tmp/script_1.py'"));
        assert!(script.starts_with("mkdir -p '/tmp' && "));

        let script = write_script(&encoded, "/tmp/sandrun-abc/Main.java");
        assert!(script.starts_with("mkdir -p '/tmp/sandrun-abc' && "));
    }

    #[test]
    fn test_remove_script_quotes_paths_and_keeps_wildcards() {
        let script = remove_script(&[
            "/work dir/sandrun-abc".to_string(),
            "/work dir/script_1*.o".to_string(),
        ])
        .unwrap();
        assert_eq!(script, "rm -rf -- '/work dir/sandrun-abc' '/work dir/script_1'*'.o'");
    }

    #[test]
    fn test_remove_script_refuses_root() {
        assert!(remove_script(&["/".to_string()]).is_err());
        assert!(remove_script(&["/*".to_string()]).is_err());
        assert!(remove_script(&["".to_string()]).is_err());
    }

    #[test]
    fn test_run_script_records_pid_and_bounds_runtime() {
        let invocation = Invocation {
            command: "java -cp /tmp Main".to_string(),
            workdir: "/tmp".to_string(),
            pid_file: "/tmp/.sandrun-abc.pid".to_string(),
            limit: Duration::from_millis(29_500),
        };
        let script = run_script(&invocation);
        assert_eq!(
            script,
            "echo $$ > '/tmp/.sandrun-abc.pid' && exec timeout -s KILL 30 sh -c 'java -cp /tmp Main'"
        );
    }

    #[test]
    fn test_terminate_script_targets_process_group() {
        let script = terminate_script("/tmp/.sandrun-abc.pid");
        assert!(script.contains("kill -KILL -- -\"$pid\""));
        assert!(script.ends_with("true"));
    }
}
