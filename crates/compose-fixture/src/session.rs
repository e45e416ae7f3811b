use tracing::{info, warn};

use crate::error::ComposeError;
use crate::orchestrator::ComposeGroup;

/// Handle to a compose project brought up by [`crate::ComposeFixture::up`].
///
/// Dropping the session releases it. Unless keep-alive was requested, release stops the
/// containers, removes them together with their volumes and networks, and frees the
/// project handle. Each step runs even if an earlier one failed.
#[must_use = "dropping the session tears the compose project down immediately"]
pub struct ComposeSession<G: ComposeGroup> {
    group: Option<G>,
    project: Option<String>,
    keep_alive: bool,
}

impl<G: ComposeGroup> ComposeSession<G> {
    pub(crate) fn live(group: G, keep_alive: bool) -> Self {
        Self {
            project: Some(group.project().to_string()),
            group: Some(group),
            keep_alive,
        }
    }

    /// Session for a bring-up that was skipped by the environment gate.
    pub(crate) fn inert(keep_alive: bool) -> Self {
        Self {
            group: None,
            project: None,
            keep_alive,
        }
    }

    pub fn is_live(&self) -> bool {
        self.group.is_some()
    }

    pub fn keeps_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub(crate) fn group(&self) -> Option<&G> {
        self.group.as_ref()
    }

    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Release the project. Only the first call does anything. Failures are logged as
    /// they happen and the last one is returned.
    pub fn release(&mut self) -> Result<(), ComposeError> {
        let Some(mut group) = self.group.take() else {
            return Ok(());
        };
        if self.keep_alive {
            info!(
                project = group.project(),
                "keep-alive set; leaving compose project running"
            );
            return Ok(());
        }
        teardown(&mut group)
    }
}

impl<G: ComposeGroup> Drop for ComposeSession<G> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Stop, remove (purging volumes) and release `group`, attempting every step.
fn teardown<G: ComposeGroup>(group: &mut G) -> Result<(), ComposeError> {
    info!(project = group.project(), "tearing down compose project");
    let mut last_error = None;

    if let Err(err) = group.stop() {
        warn!(project = group.project(), error = %err, "failed to stop compose project");
        last_error = Some(err);
    }
    if let Err(err) = group.remove(true) {
        warn!(project = group.project(), error = %err, "failed to remove compose project");
        last_error = Some(err);
    }
    if let Err(err) = group.release() {
        warn!(project = group.project(), error = %err, "failed to release compose project");
        last_error = Some(err);
    }

    match last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
