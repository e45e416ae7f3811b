use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::ComposeError;
use crate::gate;
use crate::locator::locate_compose_file;
use crate::orchestrator::{ComposeRequest, Orchestrator};
use crate::probe::{CheckFn, PortSpec, Probe, WaitCondition};
use crate::readiness::await_ready;
use crate::session::ComposeSession;
use crate::settings::FixtureSettings;

struct CustomCheck {
    service: String,
    check: CheckFn,
    timeout: Option<Duration>,
}

struct ProcessCheck {
    service: String,
    process: String,
    timeout: Duration,
}

struct PortCheck {
    service: String,
    port_and_proto: String,
    timeout: Duration,
    address: Option<IpAddr>,
}

/// Accumulated configuration. Gates are stored as already-evaluated booleans.
struct LifecycleConfig {
    compose_file: String,
    force_build: bool,
    force_recreate: bool,
    keep_alive: bool,
    target_environment: bool,
    checks: Vec<CustomCheck>,
    processes: Vec<ProcessCheck>,
    ports: Vec<PortCheck>,
    working_dir: Option<PathBuf>,
    project_name: Option<String>,
}

/// Fluent description of a compose fixture. Nothing touches the filesystem or the
/// container runtime until [`ComposeFixture::up`].
///
/// ```no_run
/// # async fn demo() -> Result<(), compose_fixture::ComposeError> {
/// use std::time::Duration;
/// use compose_fixture::{ComposeFixture, DockerCompose, FixtureSettings};
///
/// let docker = DockerCompose::new(&FixtureSettings::default())?;
/// let _session = ComposeFixture::with_compose_file("integration.compose.yml")
///     .force_build()
///     .force_recreate()
///     .wait_for_port("db", "5432/tcp", Duration::from_secs(30))
///     .keep_alive_when_env("KEEP_CONTAINERS")
///     .up(&docker)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ComposeFixture {
    config: LifecycleConfig,
    settings: FixtureSettings,
}

impl Default for ComposeFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl ComposeFixture {
    /// Fixture for the default compose file name (`docker-compose.yml` unless settings
    /// say otherwise).
    pub fn new() -> Self {
        let settings = FixtureSettings::default();
        Self::build(settings.default_compose_file.clone(), settings)
    }

    pub fn with_compose_file(file_name: impl Into<String>) -> Self {
        Self::build(file_name.into(), FixtureSettings::default())
    }

    /// Fixture whose compose file name and tunables come from `settings`.
    pub fn from_settings(settings: FixtureSettings) -> Self {
        Self::build(settings.default_compose_file.clone(), settings)
    }

    fn build(compose_file: String, settings: FixtureSettings) -> Self {
        Self {
            config: LifecycleConfig {
                compose_file,
                force_build: false,
                force_recreate: false,
                keep_alive: false,
                target_environment: true,
                checks: Vec::new(),
                processes: Vec::new(),
                ports: Vec::new(),
                working_dir: None,
                project_name: None,
            },
            settings,
        }
    }

    /// Only bring containers up when `variable` is set.
    pub fn when_environment(mut self, variable: &str) -> Self {
        self.config.target_environment = gate::exists(variable);
        self
    }

    /// Only bring containers up when `predicate` accepts the value of `variable`.
    pub fn when_environment_matches<P>(mut self, variable: &str, predicate: P) -> Self
    where
        P: FnOnce(Option<&str>) -> bool,
    {
        self.config.target_environment = gate::matches(variable, predicate);
        self
    }

    /// Wait for a caller-defined check, bounded by the default check timeout.
    pub fn wait_for_check<F>(mut self, service: &str, check: F) -> Self
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.config.checks.push(CustomCheck {
            service: service.to_string(),
            check: Arc::new(check),
            timeout: None,
        });
        self
    }

    pub fn wait_for_check_within<F>(mut self, service: &str, timeout: Duration, check: F) -> Self
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.config.checks.push(CustomCheck {
            service: service.to_string(),
            check: Arc::new(check),
            timeout: Some(timeout),
        });
        self
    }

    /// Wait until `port_and_proto` (e.g. `5432/tcp`) of `service` accepts connections.
    pub fn wait_for_port(mut self, service: &str, port_and_proto: &str, timeout: Duration) -> Self {
        self.config.ports.push(PortCheck {
            service: service.to_string(),
            port_and_proto: port_and_proto.to_string(),
            timeout,
            address: None,
        });
        self
    }

    /// Like [`ComposeFixture::wait_for_port`] but connects through `address` instead of
    /// the host IP docker published the port on.
    pub fn wait_for_port_on(
        mut self,
        service: &str,
        port_and_proto: &str,
        timeout: Duration,
        address: IpAddr,
    ) -> Self {
        self.config.ports.push(PortCheck {
            service: service.to_string(),
            port_and_proto: port_and_proto.to_string(),
            timeout,
            address: Some(address),
        });
        self
    }

    pub fn wait_for_process(mut self, service: &str, process: &str, timeout: Duration) -> Self {
        self.config.processes.push(ProcessCheck {
            service: service.to_string(),
            process: process.to_string(),
            timeout,
        });
        self
    }

    pub fn force_build(mut self) -> Self {
        self.config.force_build = true;
        self
    }

    pub fn force_recreate(mut self) -> Self {
        self.config.force_recreate = true;
        self
    }

    /// Leave the containers running after the session is released. Evaluated now.
    pub fn keep_alive_when<F>(mut self, should_keep_alive: F) -> Self
    where
        F: FnOnce() -> bool,
    {
        self.config.keep_alive = should_keep_alive();
        self
    }

    pub fn keep_alive_when_env(mut self, variable: &str) -> Self {
        self.config.keep_alive = gate::exists(variable);
        self
    }

    pub fn keep_alive_when_env_matches<P>(mut self, variable: &str, predicate: P) -> Self
    where
        P: FnOnce(Option<&str>) -> bool,
    {
        self.config.keep_alive = gate::matches(variable, predicate);
        self
    }

    /// Directory the compose file search starts from. Defaults to the process working
    /// directory at `up` time.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    pub fn project_name(mut self, name: &str) -> Self {
        self.config.project_name = Some(name.to_string());
        self
    }

    pub fn settings(mut self, settings: FixtureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn compose_file(&self) -> &str {
        &self.config.compose_file
    }

    pub fn keeps_alive(&self) -> bool {
        self.config.keep_alive
    }

    pub fn is_target_environment(&self) -> bool {
        self.config.target_environment
    }

    /// Resolve the compose file and assemble the orchestration request without starting
    /// anything.
    pub fn request(&self) -> Result<ComposeRequest, ComposeError> {
        let start = match &self.config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .map_err(|err| ComposeError::io("failed to read current directory", err))?,
        };
        let compose_file = locate_compose_file(&self.config.compose_file, &start)?;
        let project = match &self.config.project_name {
            Some(name) => sanitize(name),
            None => derive_project_name(&self.settings.project_prefix, &compose_file),
        };

        let mut wait_conditions = Vec::with_capacity(
            self.config.checks.len() + self.config.ports.len() + self.config.processes.len(),
        );
        for check in &self.config.checks {
            wait_conditions.push(WaitCondition {
                service: check.service.clone(),
                probe: Probe::Custom {
                    check: CheckFn::clone(&check.check),
                    timeout: check
                        .timeout
                        .unwrap_or_else(|| self.settings.default_check_timeout()),
                },
            });
        }
        for port in &self.config.ports {
            wait_conditions.push(WaitCondition {
                service: port.service.clone(),
                probe: Probe::Port {
                    port: port.port_and_proto.parse::<PortSpec>()?,
                    timeout: port.timeout,
                    address: port.address,
                },
            });
        }
        for process in &self.config.processes {
            wait_conditions.push(WaitCondition {
                service: process.service.clone(),
                probe: Probe::Process {
                    process: process.process.clone(),
                    timeout: process.timeout,
                },
            });
        }

        Ok(ComposeRequest {
            compose_file,
            project,
            remove_orphans: true,
            force_build: self.config.force_build,
            force_recreate: self.config.force_recreate,
            wait_conditions,
        })
    }

    /// Bring the project up and wait until every readiness condition holds.
    ///
    /// If the target-environment gate is closed this returns an inert session without
    /// touching anything. Until every condition holds the started project is owned by a
    /// session without keep-alive, so a readiness failure, a panic, or dropping this
    /// future tears it down.
    pub async fn up<O: Orchestrator>(
        self,
        orchestrator: &O,
    ) -> Result<ComposeSession<O::Group>, ComposeError> {
        if !self.config.target_environment {
            info!(
                file = %self.config.compose_file,
                "target environment gate closed; skipping compose bring-up"
            );
            return Ok(ComposeSession::inert(self.config.keep_alive));
        }

        let request = self.request()?;
        info!(
            project = %request.project,
            file = %request.compose_file.display(),
            force_build = request.force_build,
            force_recreate = request.force_recreate,
            conditions = request.wait_conditions.len(),
            "starting compose project"
        );

        let group = orchestrator.start(&request).await?;
        let mut session = ComposeSession::live(group, false);
        let ready = match session.group() {
            Some(group) => await_ready(group, &request.wait_conditions, &self.settings.poll).await,
            None => Ok(()),
        };
        if let Err(err) = ready {
            warn!(project = %request.project, error = %err, "readiness failed; rolling back");
            let _ = session.release();
            return Err(err);
        }

        session.set_keep_alive(self.config.keep_alive);
        Ok(session)
    }
}

/// `<prefix>_<directory>_<file stem>_<digest>`. The digest covers the canonical path, so
/// two compose files never share a project and one file keeps its name across runs.
fn derive_project_name(prefix: &str, compose_file: &Path) -> String {
    let dir = compose_file
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = compose_file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize(&format!("{prefix}_{dir}_{stem}_{}", path_digest(compose_file)))
}

fn path_digest(compose_file: &Path) -> String {
    let canonical = compose_file
        .canonicalize()
        .unwrap_or_else(|_| compose_file.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(8);
    digest
}

/// Compose project names must be lowercase alphanumerics, `-` or `_`, starting with a
/// letter or digit.
fn sanitize(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches(|ch| ch == '_' || ch == '-');
    if trimmed.is_empty() {
        "fixture".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn project_names_are_compose_safe() {
        assert_eq!(sanitize("My Stack.v2"), "my_stack_v2");
        assert_eq!(sanitize("__"), "fixture");
        let name =
            derive_project_name("fixture", Path::new("/repo/tests/Integration.Tests.Compose.yml"));
        let digest = name
            .strip_prefix("fixture_tests_integration_tests_compose_")
            .unwrap();
        assert_eq!(digest.len(), 8);
        assert!(digest.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn same_directory_name_in_different_trees_gets_distinct_projects() {
        let first = derive_project_name("fixture", Path::new("/a/tests/docker-compose.yml"));
        let second = derive_project_name("fixture", Path::new("/b/tests/docker-compose.yml"));
        assert_ne!(first, second);
        assert_eq!(
            first,
            derive_project_name("fixture", Path::new("/a/tests/docker-compose.yml"))
        );
    }

    #[test]
    fn gates_are_resolved_when_configured() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("COMPOSE_FIXTURE_EAGER_TARGET", "ci");
            let fixture = ComposeFixture::new()
                .when_environment_matches("COMPOSE_FIXTURE_EAGER_TARGET", |value| {
                    value == Some("ci")
                })
                .keep_alive_when_env("COMPOSE_FIXTURE_EAGER_KEEP");
            assert!(fixture.is_target_environment());
            assert!(!fixture.keeps_alive());

            jail.set_env("COMPOSE_FIXTURE_EAGER_TARGET", "local");
            jail.set_env("COMPOSE_FIXTURE_EAGER_KEEP", "1");
            assert!(fixture.is_target_environment());
            assert!(!fixture.keeps_alive());

            let fixture = fixture
                .when_environment("COMPOSE_FIXTURE_EAGER_KEEP")
                .keep_alive_when_env_matches("COMPOSE_FIXTURE_EAGER_TARGET", |value| {
                    value == Some("local")
                });
            jail.set_env("COMPOSE_FIXTURE_EAGER_KEEP", "");
            jail.set_env("COMPOSE_FIXTURE_EAGER_TARGET", "ci");
            assert!(fixture.is_target_environment());
            assert!(fixture.keeps_alive());
            Ok(())
        });
    }

    #[test]
    fn flags_are_reflected_in_request() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("docker-compose.yml"), "services: {}\n").unwrap();

        let request = ComposeFixture::new()
            .working_dir(temp.path())
            .force_build()
            .force_build()
            .force_recreate()
            .request()
            .unwrap();
        assert!(request.remove_orphans);
        assert!(request.force_build);
        assert!(request.force_recreate);
        assert_eq!(request.compose_file, temp.path().join("docker-compose.yml"));

        let plain = ComposeFixture::new()
            .working_dir(temp.path())
            .request()
            .unwrap();
        assert!(plain.remove_orphans);
        assert!(!plain.force_build);
        assert!(!plain.force_recreate);
    }

    #[test]
    fn conditions_keep_category_order() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("docker-compose.yml"), "services: {}\n").unwrap();

        let request = ComposeFixture::new()
            .working_dir(temp.path())
            .wait_for_process("worker", "celery", Duration::from_secs(5))
            .wait_for_port("db", "5432/tcp", Duration::from_secs(5))
            .wait_for_check("api", || Ok(true))
            .wait_for_port("cache", "6379", Duration::from_secs(2))
            .request()
            .unwrap();
        let order: Vec<_> = request
            .wait_conditions
            .iter()
            .map(|condition| (condition.service.as_str(), condition.probe.kind()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("api", "custom"),
                ("db", "port"),
                ("cache", "port"),
                ("worker", "process"),
            ]
        );
        assert_eq!(
            request.wait_conditions[0].probe.timeout(),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn invalid_port_is_a_configuration_error() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("docker-compose.yml"), "services: {}\n").unwrap();

        let err = ComposeFixture::new()
            .working_dir(temp.path())
            .wait_for_port("db", "5432/icmp", Duration::from_secs(1))
            .request()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn keep_alive_last_call_wins() {
        let fixture = ComposeFixture::new()
            .keep_alive_when(|| true)
            .keep_alive_when_env("COMPOSE_FIXTURE_BUILDER_TEST_UNSET_VARIABLE");
        assert!(!fixture.keeps_alive());

        let fixture = ComposeFixture::new()
            .keep_alive_when_env_matches("COMPOSE_FIXTURE_BUILDER_TEST_UNSET_VARIABLE", |v| {
                v.is_none()
            });
        assert!(fixture.keeps_alive());
    }

    #[test]
    fn construction_does_not_touch_filesystem() {
        let fixture = ComposeFixture::with_compose_file("does-not-exist-anywhere.yml")
            .wait_for_port("db", "not-a-port", Duration::from_secs(1));
        assert_eq!(fixture.compose_file(), "does-not-exist-anywhere.yml");
        assert!(fixture.is_target_environment());
    }
}
