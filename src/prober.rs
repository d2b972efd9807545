use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::types::{PortStatus, ProbeResult};

/// A failure that says nothing about the remote port, only about the local side.
#[derive(Debug, Error)]
#[error("probe of port {port} failed: {source}")]
pub struct ProbeInfrastructureError {
    pub port: u16,
    #[source]
    pub source: io::Error,
}

/// Something that can classify one (host, port) pair.
///
/// The scheduler is generic over this so tests can swap in instrumented probers.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(
        &self,
        host: Ipv4Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<ProbeResult, ProbeInfrastructureError>;
}

/// Plain TCP connect prober.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(
        &self,
        host: Ipv4Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<ProbeResult, ProbeInfrastructureError> {
        probe(host, port, timeout).await
    }
}

/// Attempt one TCP connect bounded by `timeout` and classify the outcome.
///
/// A successful stream is dropped as soon as it is classified, so the connection is
/// closed on every path.
pub async fn probe(
    host: Ipv4Addr,
    port: u16,
    timeout: Duration,
) -> Result<ProbeResult, ProbeInfrastructureError> {
    let addr = SocketAddr::V4(SocketAddrV4::new(host, port));
    let start = Instant::now();
    let connect_res = time::timeout(timeout, TcpStream::connect(addr)).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let status = match connect_res {
        Ok(Ok(stream)) => {
            drop(stream);
            PortStatus::Open
        }
        Ok(Err(e)) => classify_error(&e).ok_or(ProbeInfrastructureError { port, source: e })?,
        Err(_elapsed) => PortStatus::Filtered,
    };

    debug!(%addr, ?status, latency_ms, "probe resolved");
    Ok(ProbeResult {
        port,
        status,
        latency_ms,
    })
}

/// Map a connect error onto a port status, or `None` when it is a local fault.
fn classify_error(e: &io::Error) -> Option<PortStatus> {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            Some(PortStatus::Closed)
        }
        io::ErrorKind::TimedOut
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::PermissionDenied => Some(PortStatus::Filtered),
        _ => None,
    }
}
