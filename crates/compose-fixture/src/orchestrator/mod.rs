use std::{future::Future, net::SocketAddr, path::PathBuf};

use serde::Serialize;

use crate::error::ComposeError;
use crate::probe::{PortSpec, WaitCondition, WaitSummary};

pub mod docker;
pub use docker::{DockerCompose, DockerProject, docker_available};
pub mod memory;
pub use memory::{InMemoryOrchestrator, MemoryGroup, ProjectCalls};

/// Everything the orchestration service needs to bring one compose project up.
#[derive(Debug)]
pub struct ComposeRequest {
    pub compose_file: PathBuf,
    pub project: String,
    pub remove_orphans: bool,
    pub force_build: bool,
    pub force_recreate: bool,
    pub wait_conditions: Vec<WaitCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    pub compose_file: PathBuf,
    pub project: String,
    pub remove_orphans: bool,
    pub force_build: bool,
    pub force_recreate: bool,
    pub waits: Vec<WaitSummary>,
}

impl ComposeRequest {
    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            compose_file: self.compose_file.clone(),
            project: self.project.clone(),
            remove_orphans: self.remove_orphans,
            force_build: self.force_build,
            force_recreate: self.force_recreate,
            waits: self
                .wait_conditions
                .iter()
                .map(WaitCondition::summary)
                .collect(),
        }
    }
}

/// Starts compose projects. A failed `start` must not leave containers behind.
pub trait Orchestrator: Send + Sync {
    type Group: ComposeGroup;

    fn start(
        &self,
        request: &ComposeRequest,
    ) -> impl Future<Output = Result<Self::Group, ComposeError>> + Send;
}

/// A running compose project.
///
/// The probe primitives are polled while the readiness barrier is pending. The teardown
/// steps are synchronous so they can run from `Drop`.
pub trait ComposeGroup: Send + Sync {
    fn project(&self) -> &str;

    /// Host address published for `port` of `service`, if the mapping exists yet.
    fn published_addr(
        &self,
        service: &str,
        port: PortSpec,
    ) -> impl Future<Output = Result<Option<SocketAddr>, ComposeError>> + Send;

    /// Whether a process whose command line contains `process` runs in `service`.
    fn process_running(
        &self,
        service: &str,
        process: &str,
    ) -> impl Future<Output = Result<bool, ComposeError>> + Send;

    fn stop(&mut self) -> Result<(), ComposeError>;

    fn remove(&mut self, purge_volumes: bool) -> Result<(), ComposeError>;

    fn release(&mut self) -> Result<(), ComposeError>;
}
