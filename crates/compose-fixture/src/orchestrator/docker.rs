use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use tracing::{debug, info, warn};

use super::{ComposeGroup, ComposeRequest, Orchestrator};
use crate::error::ComposeError;
use crate::probe::PortSpec;
use crate::settings::FixtureSettings;

/// Orchestrates projects through the `docker compose` CLI.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    binary: PathBuf,
}

impl DockerCompose {
    /// Use `settings.docker_binary`, falling back to `docker` on `PATH`.
    pub fn new(settings: &FixtureSettings) -> Result<Self, ComposeError> {
        let binary = match &settings.docker_binary {
            Some(binary) => binary.clone(),
            None => which::which("docker").map_err(|err| {
                ComposeError::io(
                    "docker binary not found on PATH",
                    std::io::Error::new(std::io::ErrorKind::NotFound, err),
                )
            })?,
        };
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Whether this binary can reach a docker daemon.
    pub fn available(&self) -> bool {
        daemon_answers(&self.binary)
    }
}

impl Orchestrator for DockerCompose {
    type Group = DockerProject;

    async fn start(&self, request: &ComposeRequest) -> Result<DockerProject, ComposeError> {
        let mut project = DockerProject {
            binary: self.binary.clone(),
            compose_file: request.compose_file.clone(),
            project: request.project.clone(),
        };

        let mut args = vec!["up", "-d"];
        if request.remove_orphans {
            args.push("--remove-orphans");
        }
        if request.force_build {
            args.push("--build");
        }
        if request.force_recreate {
            args.push("--force-recreate");
        }

        info!(project = %project.project, file = %project.compose_file.display(), "docker compose up");
        let output = project
            .async_command(&args)
            .output()
            .await
            .map_err(|err| ComposeError::io("failed to execute docker compose", err))?;
        if output.status.success() {
            return Ok(project);
        }

        let reason = failure_reason(&args, &output);
        // `up -d` can fail halfway through; take down whatever did start.
        if let Err(err) = project.remove(true) {
            warn!(project = %project.project, error = %err, "rollback after failed start did not complete");
        }
        Err(ComposeError::Startup {
            project: project.project,
            reason,
        })
    }
}

#[derive(Debug)]
pub struct DockerProject {
    binary: PathBuf,
    compose_file: PathBuf,
    project: String,
}

impl DockerProject {
    pub fn compose_file(&self) -> &Path {
        &self.compose_file
    }

    fn working_dir(&self) -> &Path {
        self.compose_file.parent().unwrap_or_else(|| Path::new("."))
    }

    fn async_command(&self, args: &[&str]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .args(args)
            .env("COMPOSE_PROJECT_NAME", &self.project)
            .current_dir(self.working_dir())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn run_compose(&self, args: &[&str]) -> Result<(), ComposeError> {
        let output = Command::new(&self.binary)
            .arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .args(args)
            .env("COMPOSE_PROJECT_NAME", &self.project)
            .current_dir(self.working_dir())
            .stdin(Stdio::null())
            .output()
            .map_err(|err| ComposeError::io("failed to execute docker compose", err))?;

        if output.status.success() {
            return Ok(());
        }

        Err(ComposeError::Teardown {
            project: self.project.clone(),
            reason: failure_reason(args, &output),
        })
    }
}

impl ComposeGroup for DockerProject {
    fn project(&self) -> &str {
        &self.project
    }

    async fn published_addr(
        &self,
        service: &str,
        port: PortSpec,
    ) -> Result<Option<SocketAddr>, ComposeError> {
        let container_port = port.port.to_string();
        let args = [
            "port",
            "--protocol",
            port.protocol.as_str(),
            service,
            container_port.as_str(),
        ];
        let output = self
            .async_command(&args)
            .output()
            .await
            .map_err(|err| ComposeError::io("failed to execute docker compose port", err))?;
        if !output.status.success() {
            debug!(service, %port, "{}", failure_reason(&args, &output));
            return Ok(None);
        }
        Ok(parse_published_addr(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn process_running(&self, service: &str, process: &str) -> Result<bool, ComposeError> {
        let args = ["top", service];
        let output = self
            .async_command(&args)
            .output()
            .await
            .map_err(|err| ComposeError::io("failed to execute docker compose top", err))?;
        if !output.status.success() {
            debug!(service, "{}", failure_reason(&args, &output));
            return Ok(false);
        }
        Ok(top_lists_process(
            &String::from_utf8_lossy(&output.stdout),
            process,
        ))
    }

    fn stop(&mut self) -> Result<(), ComposeError> {
        self.run_compose(&["stop"])
    }

    fn remove(&mut self, purge_volumes: bool) -> Result<(), ComposeError> {
        if purge_volumes {
            self.run_compose(&["down", "--volumes", "--remove-orphans"])
        } else {
            self.run_compose(&["down", "--remove-orphans"])
        }
    }

    fn release(&mut self) -> Result<(), ComposeError> {
        debug!(project = %self.project, "released compose project handle");
        Ok(())
    }
}

/// Quick check to see if the Docker CLI on `PATH` and its daemon are reachable. Use
/// [`DockerCompose::available`] for a configured binary.
pub fn docker_available() -> bool {
    daemon_answers(Path::new("docker"))
}

fn daemon_answers(binary: &Path) -> bool {
    Command::new(binary)
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn failure_reason(args: &[&str], output: &Output) -> String {
    format!(
        "docker compose {:?} failed (code {:?}): {}",
        args,
        output.status.code(),
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

fn parse_published_addr(stdout: &str) -> Option<SocketAddr> {
    stdout
        .lines()
        .map(str::trim)
        .find_map(|line| line.parse::<SocketAddr>().ok())
        .filter(|addr| addr.port() != 0)
}

/// `docker compose top` prints a container name, a `UID PID ...` header and one row per
/// process. Only the rows are matched.
fn top_lists_process(stdout: &str, process: &str) -> bool {
    stdout
        .lines()
        .filter(|line| {
            let first = line.split_whitespace().next().unwrap_or_default();
            first != "UID" && line.split_whitespace().count() > 1
        })
        .any(|line| line.contains(process))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_published_address() {
        assert_eq!(
            parse_published_addr("0.0.0.0:55432\n[::]:55432\n"),
            Some("0.0.0.0:55432".parse().unwrap())
        );
        assert_eq!(
            parse_published_addr("[::]:8080\n"),
            Some("[::]:8080".parse().unwrap())
        );
        assert_eq!(parse_published_addr(":0\n"), None);
        assert_eq!(parse_published_addr(""), None);
    }

    #[test]
    fn matches_process_rows_only() {
        let top = "\
stack-db-1
UID      PID     PPID    C    STIME   TTY   TIME       CMD
999      4242    4200    0    10:01   ?     00:00:00   postgres -D /var/lib/postgresql/data
999      4250    4242    0    10:01   ?     00:00:00   postgres: checkpointer
";
        assert!(top_lists_process(top, "postgres -D"));
        assert!(top_lists_process(top, "checkpointer"));
        assert!(!top_lists_process(top, "redis-server"));
        assert!(!top_lists_process(top, "stack-db"));
        assert!(!top_lists_process(top, "STIME"));
    }

    #[test]
    fn configured_binary_decides_availability() {
        let settings = FixtureSettings {
            docker_binary: Some(PathBuf::from("/nonexistent/docker-3f9a")),
            ..FixtureSettings::default()
        };
        assert!(!DockerCompose::new(&settings).unwrap().available());
    }

    #[test]
    fn missing_binary_reports_io_error() {
        let settings = FixtureSettings {
            docker_binary: Some(PathBuf::from("/nonexistent/docker-3f9a")),
            ..FixtureSettings::default()
        };
        let docker = DockerCompose::new(&settings).unwrap();
        let project = DockerProject {
            binary: docker.binary().to_path_buf(),
            compose_file: PathBuf::from("/tmp/docker-compose.yml"),
            project: "fixture_tmp".into(),
        };
        let err = project.run_compose(&["stop"]).unwrap_err();
        assert!(matches!(err, ComposeError::Io { .. }));
    }
}
