//! Compose-backed test fixtures.
//!
//! A [`ComposeFixture`] describes a compose project and the conditions that make it
//! usable. [`ComposeFixture::up`] starts the project, waits for every condition, and
//! returns a [`ComposeSession`] that tears the project down when it goes out of scope.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use compose_fixture::{ComposeFixture, DockerCompose, FixtureSettings};
//!
//! async fn talks_to_postgres() -> anyhow::Result<()> {
//!     let docker = DockerCompose::new(&FixtureSettings::load()?)?;
//!     let _stack = ComposeFixture::with_compose_file("integration.compose.yml")
//!         .when_environment("CI")
//!         .wait_for_port("db", "5432/tcp", Duration::from_secs(30))
//!         .wait_for_process("worker", "celery", Duration::from_secs(30))
//!         .up(&docker)
//!         .await?;
//!
//!     // exercise the stack here
//!     Ok(())
//! }
//! ```

pub mod builder;
pub use builder::ComposeFixture;
pub mod error;
pub use error::ComposeError;
pub mod gate;
pub mod locator;
pub use locator::locate_compose_file;
pub mod orchestrator;
pub use orchestrator::{
    ComposeGroup, ComposeRequest, DockerCompose, InMemoryOrchestrator, Orchestrator,
    RequestSummary, docker_available,
};
pub mod probe;
pub use probe::{PortSpec, Probe, Protocol, WaitCondition};
pub mod readiness;
pub mod session;
pub use session::ComposeSession;
pub mod settings;
pub use settings::{FixtureSettings, PollSettings};
