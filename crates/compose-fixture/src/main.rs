use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use compose_fixture::{ComposeFixture, DockerCompose, FixtureSettings, locate_compose_file};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "compose-fixture",
    version,
    about = "Bring compose projects up, wait for readiness, and tear them down"
)]
struct Cli {
    /// Settings file (defaults to the user config dir, then env overrides)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a project, wait for readiness, and hold it until Ctrl-C
    Up(UpArgs),
    /// Print the compose file that would be used
    Locate(LocateArgs),
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Compose file name to search for
    #[arg(long, short = 'f')]
    file: Option<String>,
    /// Directory to start searching from (defaults to the current directory)
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct UpArgs {
    #[command(flatten)]
    locate: LocateArgs,
    /// Compose project name (derived from the compose file when omitted)
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    build: bool,
    #[arg(long)]
    recreate: bool,
    /// SERVICE=PORT[/PROTO][@ADDR], repeatable
    #[arg(long = "wait-port", value_name = "SPEC", value_parser = parse_port_wait)]
    wait_ports: Vec<PortWait>,
    /// SERVICE=PROCESS, repeatable
    #[arg(long = "wait-process", value_name = "SPEC", value_parser = parse_process_wait)]
    wait_processes: Vec<ProcessWait>,
    /// Timeout applied to every wait
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: u64,
    /// Leave containers running on exit
    #[arg(long)]
    keep_alive: bool,
    /// Print the orchestration request as JSON and exit
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct PortWait {
    service: String,
    port: String,
    address: Option<IpAddr>,
}

#[derive(Debug, Clone)]
struct ProcessWait {
    service: String,
    process: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = FixtureSettings::load_from(cli.config.as_deref())
        .context("failed to load compose-fixture settings")?;
    match cli.command {
        Command::Up(args) => up(args, settings).await?,
        Command::Locate(args) => locate(&args, &settings)?,
    }

    Ok(())
}

fn locate(args: &LocateArgs, settings: &FixtureSettings) -> Result<()> {
    let name = args
        .file
        .clone()
        .unwrap_or_else(|| settings.default_compose_file.clone());
    let start = match &args.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    let path = locate_compose_file(&name, &start)?;
    println!("{}", path.display());
    Ok(())
}

async fn up(args: UpArgs, settings: FixtureSettings) -> Result<()> {
    let timeout = Duration::from_millis(args.timeout_ms);
    let mut fixture = match &args.locate.file {
        Some(file) => ComposeFixture::with_compose_file(file.clone()).settings(settings.clone()),
        None => ComposeFixture::from_settings(settings.clone()),
    };
    if let Some(dir) = &args.locate.dir {
        fixture = fixture.working_dir(dir);
    }
    if let Some(project) = &args.project {
        fixture = fixture.project_name(project);
    }
    if args.build {
        fixture = fixture.force_build();
    }
    if args.recreate {
        fixture = fixture.force_recreate();
    }
    for wait in &args.wait_ports {
        fixture = match wait.address {
            Some(address) => fixture.wait_for_port_on(&wait.service, &wait.port, timeout, address),
            None => fixture.wait_for_port(&wait.service, &wait.port, timeout),
        };
    }
    for wait in &args.wait_processes {
        fixture = fixture.wait_for_process(&wait.service, &wait.process, timeout);
    }
    let keep_alive = args.keep_alive;
    fixture = fixture.keep_alive_when(|| keep_alive);

    if args.dry_run {
        let summary = fixture.request()?.summary();
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let docker = DockerCompose::new(&settings)?;
    let mut session = fixture.up(&docker).await?;
    let project = session.project_name().unwrap_or_default().to_string();
    println!("{project}");
    info!(%project, "compose project ready; press Ctrl-C to release");

    shutdown_signal().await;
    session
        .release()
        .with_context(|| format!("failed to tear down compose project {project}"))?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

fn parse_port_wait(raw: &str) -> Result<PortWait> {
    let (service, rest) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected SERVICE=PORT[/PROTO][@ADDR], got '{raw}'"))?;
    let (port, address) = match rest.split_once('@') {
        Some((port, address)) => (
            port,
            Some(
                address
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid address '{address}'"))?,
            ),
        ),
        None => (rest, None),
    };
    Ok(PortWait {
        service: service.to_string(),
        port: port.to_string(),
        address,
    })
}

fn parse_process_wait(raw: &str) -> Result<ProcessWait> {
    let (service, process) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected SERVICE=PROCESS, got '{raw}'"))?;
    Ok(ProcessWait {
        service: service.to_string(),
        process: process.to_string(),
    })
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_waits() {
        let wait = parse_port_wait("db=5432/tcp").unwrap();
        assert_eq!(wait.service, "db");
        assert_eq!(wait.port, "5432/tcp");
        assert!(wait.address.is_none());

        let wait = parse_port_wait("dns=53/udp@10.0.0.5").unwrap();
        assert_eq!(wait.port, "53/udp");
        assert_eq!(wait.address, Some("10.0.0.5".parse().unwrap()));

        assert!(parse_port_wait("5432/tcp").is_err());
        assert!(parse_port_wait("db=5432@nowhere").is_err());
    }

    #[test]
    fn parses_process_waits() {
        let wait = parse_process_wait("worker=celery worker").unwrap();
        assert_eq!(wait.service, "worker");
        assert_eq!(wait.process, "celery worker");
        assert!(parse_process_wait("celery").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
