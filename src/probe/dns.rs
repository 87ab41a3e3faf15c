//! DNS and TCP stages: resolve the first hop and open a connection to it.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;

use super::{ErrorClass, Stage, StageFailure};

/// Resolve `host` to socket addresses on `port`.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, StageFailure> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            StageFailure::new(
                Stage::Dns,
                ErrorClass::Dns,
                "DNS_LOOKUP_FAILED",
                format!("failed to resolve {}: {}", host, e),
            )
        })?
        .collect();

    if addrs.is_empty() {
        return Err(StageFailure::new(
            Stage::Dns,
            ErrorClass::Dns,
            "DNS_NO_ADDRESSES",
            format!("no addresses found for {}", host),
        ));
    }

    Ok(addrs)
}

/// Socket address for an IP literal host, which needs no resolution.
pub fn literal(host: &str, port: u16) -> Option<SocketAddr> {
    host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port))
}

/// Connect to the first reachable address, in resolution order.
pub async fn connect_any(addrs: &[SocketAddr]) -> Result<(TcpStream, SocketAddr), StageFailure> {
    let mut last_err = None;

    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok((stream, *addr));
            }
            Err(e) => {
                tracing::debug!("TCP connect to {} failed: {}", addr, e);
                last_err = Some((*addr, e));
            }
        }
    }

    Err(match last_err {
        Some((addr, e)) => {
            let code = match e.kind() {
                ErrorKind::ConnectionRefused => "TCP_CONNECTION_REFUSED",
                ErrorKind::ConnectionReset => "TCP_CONNECTION_RESET",
                ErrorKind::TimedOut => "TCP_CONNECT_TIMEOUT",
                ErrorKind::AddrNotAvailable => "TCP_ADDRESS_UNAVAILABLE",
                ErrorKind::PermissionDenied => "TCP_PERMISSION_DENIED",
                _ => "TCP_CONNECT_FAILED",
            };
            StageFailure::new(
                Stage::Tcp,
                ErrorClass::Tcp,
                code,
                format!("connect to {} failed: {}", addr, e),
            )
        }
        None => StageFailure::new(
            Stage::Tcp,
            ErrorClass::Tcp,
            "TCP_NO_ADDRESSES",
            "nothing to connect to",
        ),
    })
}
