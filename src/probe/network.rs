//! Staged network prober used in production.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant as Deadline;
use tokio_rustls::TlsConnector;

use super::http::RequestForm;
use super::{
    classify_status, dns, http, tls, tunnel, ProbeError, ProbeOutcome, ProbeTarget, Prober, Stage,
    StageFailure, StageReport, StageStatus,
};
use crate::profile::{Profile, Route};

pub const USER_AGENT: &str = concat!("egresswatch/", env!("CARGO_PKG_VERSION"));

/// Anything a probe can speak HTTP over: plain TCP, a tunnel, or TLS on top.
trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ProbeStream for T {}

type BoxedStream = Box<dyn ProbeStream>;

/// Records per-stage evidence and enforces the probe deadline on each stage.
struct StageLog {
    deadline: Deadline,
    reports: Vec<StageReport>,
}

impl StageLog {
    fn new(deadline: Deadline) -> Self {
        Self {
            deadline,
            reports: Vec::with_capacity(5),
        }
    }

    async fn run<T, F>(&mut self, stage: Stage, fut: F) -> Result<T, StageFailure>
    where
        F: Future<Output = Result<T, StageFailure>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(r) => r,
            Err(_) => Err(StageFailure::timeout(stage)),
        };

        self.reports.push(StageReport {
            stage,
            status: if result.is_ok() {
                StageStatus::Ok
            } else {
                StageStatus::Failed
            },
            elapsed_ms: started.elapsed().as_millis() as u64,
            detail: result.as_ref().err().map(|f| f.message.clone()),
        });

        result
    }

    /// Attach detail to the stage that just succeeded.
    fn annotate(&mut self, detail: impl Into<String>) {
        if let Some(last) = self.reports.last_mut() {
            last.detail = Some(detail.into());
        }
    }

    fn skip(&mut self, stage: Stage, reason: &str) {
        self.reports.push(StageReport {
            stage,
            status: StageStatus::Skipped,
            elapsed_ms: 0,
            detail: Some(reason.to_string()),
        });
    }
}

/// Probes profiles over the real network, stage by stage.
pub struct NetworkProber {
    tls: TlsConnector,
    user_agent: String,
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProber {
    pub fn new() -> Self {
        Self {
            tls: tls::connector(),
            user_agent: USER_AGENT.to_string(),
        }
    }

    /// Walk the stages and return the target's HTTP status.
    async fn run_stages(
        &self,
        route: &Route,
        target: &ProbeTarget,
        log: &mut StageLog,
    ) -> Result<u16, StageFailure> {
        let (hop_host, hop_port) = match route.proxy() {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (target.host.as_str(), target.port),
        };

        // DNS
        let addrs = match dns::literal(hop_host, hop_port) {
            Some(addr) => {
                log.skip(Stage::Dns, "literal address");
                vec![addr]
            }
            None => {
                let addrs = log.run(Stage::Dns, dns::resolve(hop_host, hop_port)).await?;
                log.annotate(format!(
                    "{} -> {} address(es), first {}",
                    hop_host,
                    addrs.len(),
                    addrs[0].ip()
                ));
                addrs
            }
        };

        // TCP
        let (tcp, peer) = log.run(Stage::Tcp, dns::connect_any(&addrs)).await?;
        log.annotate(format!("connected to {}", peer));

        // Tunnel
        let mut form = RequestForm::Origin;
        let stream: BoxedStream = match route {
            Route::Direct => Box::new(tcp),
            Route::HttpProxy(proxy) if !target.tls => {
                // Plain http is forwarded by the proxy, the way routed clients send it.
                log.skip(Stage::Tunnel, "plain http target forwarded by proxy");
                form = RequestForm::Forwarded {
                    credentials: proxy.credentials.as_ref(),
                };
                Box::new(tcp)
            }
            Route::HttpProxy(proxy) => {
                let mut tcp = tcp;
                let authority = target.authority();
                let status = log
                    .run(
                        Stage::Tunnel,
                        tunnel::http_connect(&mut tcp, &authority, proxy.credentials.as_ref()),
                    )
                    .await?;
                log.annotate(format!("CONNECT {} -> {}", authority, status));
                Box::new(tcp)
            }
            Route::Socks5(proxy) => {
                let remote_dns = proxy.remote_dns();
                let socks = log
                    .run(
                        Stage::Tunnel,
                        tunnel::socks5_connect(
                            tcp,
                            &target.host,
                            target.port,
                            remote_dns,
                            proxy.credentials.as_ref(),
                        ),
                    )
                    .await?;
                log.annotate(format!(
                    "SOCKS5 tunnel to {} ({} DNS)",
                    target.authority(),
                    if remote_dns { "remote" } else { "local" }
                ));
                Box::new(socks)
            }
        };

        // TLS
        let stream: BoxedStream = if target.tls {
            let tls_stream = log
                .run(Stage::Tls, tls::handshake(&self.tls, &target.host, stream))
                .await?;
            log.annotate(tls::protocol_version(&tls_stream));
            Box::new(tls_stream)
        } else {
            log.skip(Stage::Tls, "plain http target");
            stream
        };

        // HTTP
        let status = log
            .run(Stage::Http, http::get_status(stream, target, &self.user_agent, form))
            .await?;
        log.annotate(format!("HTTP {}", status));
        Ok(status)
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(
        &self,
        profile: &Profile,
        target: &ProbeTarget,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        if !profile.enabled {
            return Err(ProbeError::Disabled(profile.name.clone()));
        }
        let route = profile.route()?;

        let started = Instant::now();
        let mut log = StageLog::new(Deadline::now() + timeout);

        let result = self.run_stages(&route, target, &mut log).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(status) => match classify_status(status) {
                None => ProbeOutcome::success(status, latency_ms, log.reports),
                Some(failure) => {
                    if let Some(http) = log.reports.last_mut() {
                        http.status = StageStatus::Failed;
                    }
                    ProbeOutcome::failure(failure, latency_ms, log.reports)
                }
            },
            Err(failure) => ProbeOutcome::failure(failure, latency_ms, log.reports),
        };

        if outcome.ok {
            tracing::debug!(
                "Probe {} -> {}: HTTP {:?} in {}ms",
                profile.name,
                target.host,
                outcome.http_status,
                latency_ms
            );
        } else {
            tracing::debug!(
                "Probe {} -> {} failed: {:?} {:?}",
                profile.name,
                target.host,
                outcome.error_class,
                outcome.error_code
            );
        }

        Ok(outcome)
    }
}
