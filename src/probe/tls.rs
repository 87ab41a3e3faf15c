//! TLS stage: handshake with the target over the established stream.

use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::{ErrorClass, Stage, StageFailure};

/// Build a connector trusting the Mozilla root set.
pub fn connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Perform the handshake using `host` for SNI and certificate validation.
pub async fn handshake<S>(
    connector: &TlsConnector,
    host: &str,
    stream: S,
) -> Result<TlsStream<S>, StageFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
        StageFailure::new(
            Stage::Tls,
            ErrorClass::Tls,
            "TLS_INVALID_SERVER_NAME",
            format!("invalid server name {}: {}", host, e),
        )
    })?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| classify_handshake_error(host, &e))
}

/// Negotiated protocol version, for stage evidence.
pub fn protocol_version<S>(stream: &TlsStream<S>) -> String {
    stream
        .get_ref()
        .1
        .protocol_version()
        .map(|v| format!("{:?}", v))
        .unwrap_or_else(|| "unknown".to_string())
}

fn classify_handshake_error(host: &str, e: &std::io::Error) -> StageFailure {
    let text = e.to_string();
    let code = if text.contains("certificate") || text.contains("Certificate") {
        "TLS_CERTIFICATE_INVALID"
    } else if e.kind() == std::io::ErrorKind::UnexpectedEof
        || e.kind() == std::io::ErrorKind::ConnectionReset
    {
        "TLS_CONNECTION_CLOSED"
    } else {
        "TLS_HANDSHAKE_FAILED"
    };

    StageFailure::new(
        Stage::Tls,
        ErrorClass::Tls,
        code,
        format!("TLS handshake with {} failed: {}", host, text),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_handshake_against_plain_http_fails() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let err = handshake(&connector(), "venue.test", client).await.unwrap_err();
        assert_eq!(err.stage, Stage::Tls);
        assert_eq!(err.class, ErrorClass::Tls);
    }

    #[tokio::test]
    async fn test_handshake_peer_closes() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);

        let err = handshake(&connector(), "venue.test", client).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Tls);
    }

    #[tokio::test]
    async fn test_invalid_server_name() {
        let (client, _server) = tokio::io::duplex(1024);
        let err = handshake(&connector(), "bad host name", client).await.unwrap_err();
        assert_eq!(err.code, "TLS_INVALID_SERVER_NAME");
    }
}
