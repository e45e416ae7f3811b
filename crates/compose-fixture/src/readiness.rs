use std::{
    future::Future,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use futures::future::try_join_all;
use tokio::{
    net::{TcpStream, UdpSocket},
    task::spawn_blocking,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, info};

use crate::error::ComposeError;
use crate::orchestrator::ComposeGroup;
use crate::probe::{CheckFn, PortSpec, Probe, Protocol, WaitCondition};
use crate::settings::PollSettings;

/// Result of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Ready,
    RetryAfter(Duration),
}

/// Wait until every condition is satisfied. Conditions are polled concurrently; the first
/// timeout or fault cancels the others and is returned.
pub async fn await_ready<G: ComposeGroup>(
    group: &G,
    conditions: &[WaitCondition],
    poll: &PollSettings,
) -> Result<(), ComposeError> {
    if conditions.is_empty() {
        return Ok(());
    }
    let started = Instant::now();
    try_join_all(
        conditions
            .iter()
            .map(|condition| await_condition(group, condition, poll)),
    )
    .await?;
    info!(
        project = group.project(),
        conditions = conditions.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all readiness conditions satisfied"
    );
    Ok(())
}

async fn await_condition<G: ComposeGroup>(
    group: &G,
    condition: &WaitCondition,
    poll: &PollSettings,
) -> Result<(), ComposeError> {
    let service = condition.service.as_str();
    let kind = condition.probe.kind();
    let budget = condition.probe.timeout();
    match &condition.probe {
        Probe::Custom { check, .. } => {
            poll_until(service, kind, budget, |attempt, _| {
                custom_attempt(service, check, attempt, poll)
            })
            .await
        }
        Probe::Port { port, address, .. } => {
            poll_until(service, kind, budget, |_, deadline| {
                within_deadline(
                    deadline,
                    poll.port_interval(),
                    port_attempt(group, service, *port, *address, poll),
                )
            })
            .await
        }
        Probe::Process { process, .. } => {
            poll_until(service, kind, budget, |_, deadline| {
                within_deadline(
                    deadline,
                    poll.process_interval(),
                    process_attempt(group, service, process, poll),
                )
            })
            .await
        }
    }
}

/// Drive `attempt` until it reports ready or `budget` runs out. `attempt` receives the
/// attempt number and the deadline. A timeout is only reported after an attempt made at
/// or past the deadline failed.
pub async fn poll_until<F, Fut>(
    service: &str,
    kind: &'static str,
    budget: Duration,
    mut attempt: F,
) -> Result<(), ComposeError>
where
    F: FnMut(u32, Instant) -> Fut,
    Fut: Future<Output = Result<Attempt, ComposeError>>,
{
    let started = Instant::now();
    let deadline = started
        .checked_add(budget)
        .unwrap_or_else(|| started + Duration::from_secs(60 * 60 * 24 * 365));
    let mut count: u32 = 0;
    loop {
        match attempt(count, deadline).await? {
            Attempt::Ready => {
                debug!(
                    service,
                    probe = kind,
                    attempts = count + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "readiness probe satisfied"
                );
                return Ok(());
            }
            Attempt::RetryAfter(delay) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ComposeError::ProbeTimedOut {
                        service: service.to_string(),
                        probe: kind,
                        timeout: budget,
                    });
                }
                sleep(delay.min(deadline - now)).await;
                count = count.saturating_add(1);
            }
        }
    }
}

/// Cut an attempt short at `deadline`; an attempt cut short is retried after `retry`.
async fn within_deadline<Fut>(
    deadline: Instant,
    retry: Duration,
    attempt: Fut,
) -> Result<Attempt, ComposeError>
where
    Fut: Future<Output = Result<Attempt, ComposeError>>,
{
    let remaining = deadline.saturating_duration_since(Instant::now());
    match timeout(remaining, attempt).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => Ok(Attempt::RetryAfter(retry)),
    }
}

/// The check runs on the blocking pool so a slow predicate cannot stall the other probes.
/// A panicking check is a fault.
async fn custom_attempt(
    service: &str,
    check: &CheckFn,
    attempt: u32,
    poll: &PollSettings,
) -> Result<Attempt, ComposeError> {
    let check = CheckFn::clone(check);
    let outcome = match spawn_blocking(move || check()).await {
        Ok(outcome) => outcome,
        Err(err) => Err(anyhow::anyhow!("readiness check did not complete: {err}")),
    };
    match outcome {
        Ok(true) => Ok(Attempt::Ready),
        Ok(false) => {
            let delay = poll.check_delay(attempt);
            debug!(service, attempt, delay_ms = delay.as_millis() as u64, "custom check not ready");
            Ok(Attempt::RetryAfter(delay))
        }
        Err(source) => Err(ComposeError::ProbeFault {
            service: service.to_string(),
            source,
        }),
    }
}

async fn port_attempt<G: ComposeGroup>(
    group: &G,
    service: &str,
    port: PortSpec,
    address: Option<IpAddr>,
    poll: &PollSettings,
) -> Result<Attempt, ComposeError> {
    let retry = Ok(Attempt::RetryAfter(poll.port_interval()));
    let published = match group.published_addr(service, port).await {
        Ok(Some(published)) => published,
        Ok(None) => {
            debug!(service, %port, "port not published yet");
            return retry;
        }
        Err(err) => {
            debug!(service, %port, error = %err, "port lookup failed");
            return retry;
        }
    };

    let target = probe_target(published, address);
    if reachable(target, port.protocol, poll.connect_timeout()).await {
        Ok(Attempt::Ready)
    } else {
        debug!(service, %port, %target, "port not reachable yet");
        retry
    }
}

async fn process_attempt<G: ComposeGroup>(
    group: &G,
    service: &str,
    process: &str,
    poll: &PollSettings,
) -> Result<Attempt, ComposeError> {
    match group.process_running(service, process).await {
        Ok(true) => Ok(Attempt::Ready),
        Ok(false) => Ok(Attempt::RetryAfter(poll.process_interval())),
        Err(err) => {
            debug!(service, process, error = %err, "process lookup failed");
            Ok(Attempt::RetryAfter(poll.process_interval()))
        }
    }
}

/// An explicit address replaces the published host IP; wildcard binds map to loopback.
pub fn probe_target(published: SocketAddr, address: Option<IpAddr>) -> SocketAddr {
    let ip = match address {
        Some(ip) => ip,
        None => match published.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        },
    };
    SocketAddr::new(ip, published.port())
}

async fn reachable(target: SocketAddr, protocol: Protocol, connect_timeout: Duration) -> bool {
    match protocol {
        Protocol::Tcp => matches!(
            timeout(connect_timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        ),
        Protocol::Udp => udp_reachable(target, connect_timeout).await,
    }
}

/// UDP has no handshake: send an empty datagram and treat anything but an ICMP
/// "port unreachable" (surfaced as `ConnectionRefused`) as a listening peer.
async fn udp_reachable(target: SocketAddr, wait: Duration) -> bool {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let Ok(socket) = UdpSocket::bind(local).await else {
        return false;
    };
    if socket.connect(target).await.is_err() || socket.send(&[]).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 64];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => err.kind() != ErrorKind::ConnectionRefused,
        Err(_elapsed) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[test]
    fn wildcard_publish_maps_to_loopback() {
        let published: SocketAddr = "0.0.0.0:55432".parse().unwrap();
        assert_eq!(
            probe_target(published, None),
            "127.0.0.1:55432".parse::<SocketAddr>().unwrap()
        );
        let published: SocketAddr = "[::]:55432".parse().unwrap();
        assert_eq!(
            probe_target(published, None),
            "[::1]:55432".parse::<SocketAddr>().unwrap()
        );
        let explicit: IpAddr = "192.168.1.20".parse().unwrap();
        assert_eq!(
            probe_target(published, Some(explicit)),
            "192.168.1.20:55432".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out_no_earlier_than_budget() {
        let budget = Duration::from_millis(3_000);
        let started = Instant::now();
        let err = poll_until("svc", "custom", budget, |_, _| async {
            Ok(Attempt::RetryAfter(Duration::from_millis(700)))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ComposeError::ProbeTimedOut { .. }));
        assert!(started.elapsed() >= budget);
        assert!(started.elapsed() < budget + Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_check_follows_shrinking_delays() {
        let poll = PollSettings::default();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let check: CheckFn = Arc::new(move || -> anyhow::Result<bool> {
            Ok(counter.fetch_add(1, Ordering::SeqCst) == 3)
        });

        let started = Instant::now();
        poll_until("svc", "custom", Duration::from_secs(60), |attempt, _| {
            let check = CheckFn::clone(&check);
            let poll = poll.clone();
            async move { custom_attempt("svc", &check, attempt, &poll).await }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1000 + 900 + 800 ms of backoff before the fourth attempt.
        assert_eq!(started.elapsed(), Duration::from_millis(2_700));
    }

    #[tokio::test]
    async fn faulting_check_aborts_immediately() {
        let check: CheckFn = Arc::new(|| -> anyhow::Result<bool> {
            Err(anyhow::anyhow!("connection pool exploded"))
        });
        let err = poll_until("api", "custom", Duration::from_secs(60), |attempt, _| {
            let check = CheckFn::clone(&check);
            async move {
                custom_attempt("api", &check, attempt, &PollSettings::default()).await
            }
        })
        .await
        .unwrap_err();
        match err {
            ComposeError::ProbeFault { service, source } => {
                assert_eq!(service, "api");
                assert!(source.to_string().contains("connection pool exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Lookups that never answer, like a hung `docker compose port`.
    struct StalledGroup;

    impl ComposeGroup for StalledGroup {
        fn project(&self) -> &str {
            "stalled"
        }

        async fn published_addr(
            &self,
            _service: &str,
            _port: PortSpec,
        ) -> Result<Option<SocketAddr>, ComposeError> {
            std::future::pending().await
        }

        async fn process_running(
            &self,
            _service: &str,
            _process: &str,
        ) -> Result<bool, ComposeError> {
            std::future::pending().await
        }

        fn stop(&mut self) -> Result<(), ComposeError> {
            Ok(())
        }

        fn remove(&mut self, _purge_volumes: bool) -> Result<(), ComposeError> {
            Ok(())
        }

        fn release(&mut self) -> Result<(), ComposeError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_lookups_end_at_the_deadline() {
        let budget = Duration::from_millis(1_500);
        let conditions = [
            WaitCondition {
                service: "db".into(),
                probe: Probe::Port {
                    port: PortSpec::tcp(5432),
                    timeout: budget,
                    address: None,
                },
            },
            WaitCondition {
                service: "worker".into(),
                probe: Probe::Process {
                    process: "celery".into(),
                    timeout: budget,
                },
            },
        ];

        let started = Instant::now();
        let err = await_ready(&StalledGroup, &conditions, &PollSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ComposeError::ProbeTimedOut { .. }));
        assert_eq!(started.elapsed(), budget);
    }

    #[tokio::test]
    async fn blocking_check_does_not_stall_other_probes() {
        let slow: CheckFn = Arc::new(|| -> anyhow::Result<bool> {
            std::thread::sleep(Duration::from_millis(1_500));
            Ok(true)
        });
        let fast: CheckFn = Arc::new(|| -> anyhow::Result<bool> { Ok(false) });
        let conditions = [
            WaitCondition {
                service: "slow".into(),
                probe: Probe::Custom {
                    check: slow,
                    timeout: Duration::from_secs(10),
                },
            },
            WaitCondition {
                service: "fast".into(),
                probe: Probe::Custom {
                    check: fast,
                    timeout: Duration::from_millis(100),
                },
            },
        ];

        let started = Instant::now();
        let err = await_ready(&StalledGroup, &conditions, &PollSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ComposeError::ProbeTimedOut { ref service, .. } if service == "fast"));
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn panicking_check_is_a_fault() {
        let check: CheckFn = Arc::new(|| -> anyhow::Result<bool> { panic!("client blew up") });
        let err = custom_attempt("api", &check, 0, &PollSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ComposeError::ProbeFault { ref service, .. } if service == "api"));
    }

    #[tokio::test]
    async fn tcp_listener_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(reachable(addr, Protocol::Tcp, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn udp_listener_is_reachable() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(reachable(addr, Protocol::Udp, Duration::from_millis(100)).await);
    }
}
