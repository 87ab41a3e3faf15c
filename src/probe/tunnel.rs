//! Tunnel stage: open a byte stream to the target through a proxy.
//!
//! HTTP proxies are driven with `CONNECT`; SOCKS proxies through
//! `tokio-socks`, with username/password auth when the descriptor has it.

use base64::{engine::general_purpose, Engine as _};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_socks::tcp::Socks5Stream;

use super::{dns, ErrorClass, Stage, StageFailure};
use crate::profile::Credentials;

/// Upper bound on a `CONNECT` response head; anything larger is malformed.
const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;

fn tunnel_failure(class: ErrorClass, code: &str, message: impl Into<String>) -> StageFailure {
    StageFailure::new(Stage::Tunnel, class, code, message)
}

fn io_failure(what: &str, e: std::io::Error) -> StageFailure {
    tunnel_failure(ErrorClass::Tcp, "PROXY_IO_ERROR", format!("{}: {}", what, e))
}

/// `Proxy-Authorization` value for Basic auth.
pub fn basic_auth(creds: &Credentials) -> String {
    let token = general_purpose::STANDARD.encode(format!("{}:{}", creds.username, creds.password));
    format!("Basic {}", token)
}

/// Ask an HTTP proxy to `CONNECT` to `authority` (`host:port`).
///
/// Returns the proxy status on success so callers can record it.
pub async fn http_connect<S>(
    stream: &mut S,
    authority: &str,
    credentials: Option<&Credentials>,
) -> Result<u16, StageFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {a} HTTP/1.1\r\nHost: {a}\r\n", a = authority);
    if let Some(creds) = credentials {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", basic_auth(creds)));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| io_failure("failed to send CONNECT", e))?;

    let status = read_connect_status(stream).await?;
    match status {
        200..=299 => Ok(status),
        407 => Err(tunnel_failure(
            ErrorClass::Auth,
            "PROXY_AUTH_REQUIRED",
            if credentials.is_some() {
                "proxy rejected the configured credentials (407)"
            } else {
                "proxy requires authentication (407)"
            },
        )),
        other => Err(tunnel_failure(
            ErrorClass::Tcp,
            "PROXY_TUNNEL_REJECTED",
            format!("proxy refused CONNECT {} with status {}", authority, other),
        )),
    }
}

/// Read the proxy's answer to `CONNECT` and return its status code.
///
/// The target speaks only after the client does, so the head must be the
/// last thing the proxy sent.
async fn read_connect_status<S>(stream: &mut S) -> Result<u16, StageFailure>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| io_failure("failed to read CONNECT response", e))?;
        if n == 0 {
            return Err(tunnel_failure(
                ErrorClass::Tcp,
                "PROXY_CONNECTION_CLOSED",
                format!("proxy closed the connection after {} bytes", buf.len()),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                if len != buf.len() {
                    return Err(tunnel_failure(
                        ErrorClass::Tcp,
                        "PROXY_MALFORMED_RESPONSE",
                        "proxy sent data after the CONNECT response",
                    ));
                }
                return response.code.ok_or_else(|| {
                    tunnel_failure(
                        ErrorClass::Tcp,
                        "PROXY_MALFORMED_RESPONSE",
                        "missing status code",
                    )
                });
            }
            Ok(httparse::Status::Partial) if buf.len() >= MAX_HEAD_BYTES => {
                return Err(tunnel_failure(
                    ErrorClass::Tcp,
                    "PROXY_MALFORMED_RESPONSE",
                    "CONNECT response head too large",
                ));
            }
            Ok(httparse::Status::Partial) => {}
            Err(e) => {
                return Err(tunnel_failure(
                    ErrorClass::Tcp,
                    "PROXY_MALFORMED_RESPONSE",
                    format!("invalid CONNECT response: {}", e),
                ));
            }
        }
    }
}

/// Run a SOCKS5 `CONNECT` to `host:port` over `stream`.
///
/// With `remote_dns` (`socks5h`) the host name goes to the proxy as is.
/// Otherwise (`socks5`) it is resolved here and the proxy gets an address,
/// matching how routed clients use the same descriptor.
pub async fn socks5_connect<S>(
    stream: S,
    host: &str,
    port: u16,
    remote_dns: bool,
    credentials: Option<&Credentials>,
) -> Result<Socks5Stream<S>, StageFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = if remote_dns {
        socks5_handshake(stream, (host, port), credentials).await
    } else {
        let addr = resolve_target(host, port).await?;
        socks5_handshake(stream, addr, credentials).await
    };

    result.map_err(|e| describe_socks_error(e, host, port))
}

async fn socks5_handshake<'t, S, T>(
    stream: S,
    target: T,
    credentials: Option<&Credentials>,
) -> Result<Socks5Stream<S>, tokio_socks::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: tokio_socks::IntoTargetAddr<'t>,
{
    match credentials {
        Some(creds) => {
            Socks5Stream::connect_with_password_and_socket(
                stream,
                target,
                &creds.username,
                &creds.password,
            )
            .await
        }
        None => Socks5Stream::connect_with_socket(stream, target).await,
    }
}

/// Local lookup of the target for `socks5` profiles.
async fn resolve_target(host: &str, port: u16) -> Result<SocketAddr, StageFailure> {
    if let Some(addr) = dns::literal(host, port) {
        return Ok(addr);
    }
    let addrs = dns::resolve(host, port).await.map_err(|f| StageFailure {
        stage: Stage::Tunnel,
        ..f
    })?;
    Ok(addrs[0])
}

fn describe_socks_error(e: tokio_socks::Error, host: &str, port: u16) -> StageFailure {
    use tokio_socks::Error;

    let refused = |code: u8, text: &str| {
        tunnel_failure(
            ErrorClass::Tcp,
            &format!("SOCKS_REPLY_{}", code),
            format!("proxy could not connect to {}:{}: {}", host, port, text),
        )
    };

    match e {
        Error::Io(e) => io_failure("SOCKS handshake failed", e),
        Error::InvalidResponseVersion => tunnel_failure(
            ErrorClass::Tcp,
            "SOCKS_BAD_VERSION",
            "proxy answered with an unexpected SOCKS version",
        ),
        Error::NoAcceptableAuthMethods => tunnel_failure(
            ErrorClass::Auth,
            "SOCKS_NO_ACCEPTABLE_METHOD",
            "proxy accepts none of the offered authentication methods",
        ),
        Error::PasswordAuthFailure(_) => tunnel_failure(
            ErrorClass::Auth,
            "SOCKS_AUTH_REJECTED",
            "proxy rejected the configured credentials",
        ),
        Error::InvalidAuthValues(reason) => {
            tunnel_failure(ErrorClass::Auth, "SOCKS_CREDENTIALS_INVALID", reason)
        }
        Error::GeneralSocksServerFailure => refused(1, "general server failure"),
        Error::ConnectionNotAllowedByRuleset => refused(2, "connection not allowed by ruleset"),
        Error::NetworkUnreachable => refused(3, "network unreachable"),
        Error::HostUnreachable => refused(4, "host unreachable"),
        Error::ConnectionRefused => refused(5, "connection refused"),
        Error::TtlExpired => refused(6, "TTL expired"),
        Error::CommandNotSupported => refused(7, "command not supported"),
        Error::AddressTypeNotSupported => refused(8, "address type not supported"),
        other => tunnel_failure(
            ErrorClass::Tcp,
            "SOCKS_PROTOCOL_ERROR",
            format!("SOCKS handshake failed: {}", other),
        ),
    }
}
