use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;

use super::{ComposeGroup, ComposeRequest, Orchestrator, RequestSummary};
use crate::error::ComposeError;
use crate::probe::PortSpec;

/// Teardown calls observed for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectCalls {
    pub starts: usize,
    pub stops: usize,
    pub removes: usize,
    pub purged_volumes: bool,
    pub releases: usize,
}

impl ProjectCalls {
    pub fn running(&self) -> bool {
        self.starts > self.removes
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    requests: Vec<RequestSummary>,
    projects: HashMap<String, ProjectCalls>,
    published: HashMap<(String, PortSpec), SocketAddr>,
    processes: HashMap<String, Vec<String>>,
    fail_start: Option<String>,
    fail_stop: Option<String>,
    fail_remove: Option<String>,
    fail_release: Option<String>,
}

/// Orchestrator that keeps everything in memory. Records every request and teardown call
/// and lets callers publish ports or processes at any time, including while a bring-up
/// is waiting on them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrchestrator {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_port(&self, service: &str, port: PortSpec, addr: SocketAddr) {
        self.inner
            .lock()
            .published
            .insert((service.to_string(), port), addr);
    }

    pub fn start_process(&self, service: &str, command_line: &str) {
        self.inner
            .lock()
            .processes
            .entry(service.to_string())
            .or_default()
            .push(command_line.to_string());
    }

    pub fn fail_start(&self, reason: &str) {
        self.inner.lock().fail_start = Some(reason.to_string());
    }

    pub fn fail_stop(&self, reason: &str) {
        self.inner.lock().fail_stop = Some(reason.to_string());
    }

    pub fn fail_remove(&self, reason: &str) {
        self.inner.lock().fail_remove = Some(reason.to_string());
    }

    pub fn fail_release(&self, reason: &str) {
        self.inner.lock().fail_release = Some(reason.to_string());
    }

    pub fn requests(&self) -> Vec<RequestSummary> {
        self.inner.lock().requests.clone()
    }

    pub fn calls(&self, project: &str) -> ProjectCalls {
        self.inner
            .lock()
            .projects
            .get(project)
            .cloned()
            .unwrap_or_default()
    }
}

impl Orchestrator for InMemoryOrchestrator {
    type Group = MemoryGroup;

    async fn start(&self, request: &ComposeRequest) -> Result<MemoryGroup, ComposeError> {
        let mut guard = self.inner.lock();
        guard.requests.push(request.summary());
        if let Some(reason) = guard.fail_start.clone() {
            return Err(ComposeError::Startup {
                project: request.project.clone(),
                reason,
            });
        }
        guard
            .projects
            .entry(request.project.clone())
            .or_default()
            .starts += 1;
        Ok(MemoryGroup {
            project: request.project.clone(),
            state: Arc::clone(&self.inner),
        })
    }
}

#[derive(Debug)]
pub struct MemoryGroup {
    project: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryGroup {
    fn record(
        &self,
        failure: impl FnOnce(&MemoryState) -> Option<String>,
        update: impl FnOnce(&mut ProjectCalls),
    ) -> Result<(), ComposeError> {
        let mut guard = self.state.lock();
        update(guard.projects.entry(self.project.clone()).or_default());
        match failure(&*guard) {
            Some(reason) => Err(ComposeError::Teardown {
                project: self.project.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl ComposeGroup for MemoryGroup {
    fn project(&self) -> &str {
        &self.project
    }

    async fn published_addr(
        &self,
        service: &str,
        port: PortSpec,
    ) -> Result<Option<SocketAddr>, ComposeError> {
        Ok(self
            .state
            .lock()
            .published
            .get(&(service.to_string(), port))
            .copied())
    }

    async fn process_running(&self, service: &str, process: &str) -> Result<bool, ComposeError> {
        Ok(self
            .state
            .lock()
            .processes
            .get(service)
            .is_some_and(|running| running.iter().any(|cmd| cmd.contains(process))))
    }

    fn stop(&mut self) -> Result<(), ComposeError> {
        self.record(|state| state.fail_stop.clone(), |calls| calls.stops += 1)
    }

    fn remove(&mut self, purge_volumes: bool) -> Result<(), ComposeError> {
        self.record(
            |state| state.fail_remove.clone(),
            |calls| {
                calls.removes += 1;
                calls.purged_volumes |= purge_volumes;
            },
        )
    }

    fn release(&mut self) -> Result<(), ComposeError> {
        self.record(|state| state.fail_release.clone(), |calls| calls.releases += 1)
    }
}
