//! HTTP stage: a single GET over an already established stream.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{ACCEPT, CONNECTION, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use super::tunnel::basic_auth;
use super::{ErrorClass, ProbeTarget, Stage, StageFailure};
use crate::profile::Credentials;

/// How the request line addresses the target.
#[derive(Debug, Clone, Copy)]
pub enum RequestForm<'a> {
    /// `GET /path`, straight to the target or through a tunnel.
    Origin,
    /// `GET http://host/path` to an HTTP proxy that forwards it.
    Forwarded { credentials: Option<&'a Credentials> },
}

/// Aborts the connection driver when the stage ends, including on timeout.
struct ConnectionTask(JoinHandle<()>);

impl Drop for ConnectionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn http_failure(code: &str, message: impl Into<String>) -> StageFailure {
    StageFailure::new(Stage::Http, ErrorClass::Http, code, message)
}

fn describe_hyper_error(e: &hyper::Error) -> StageFailure {
    let code = if e.is_parse() || e.is_parse_status() {
        "HTTP_MALFORMED_RESPONSE"
    } else if e.is_incomplete_message() || e.is_closed() {
        "HTTP_CONNECTION_CLOSED"
    } else {
        "HTTP_READ_FAILED"
    };
    http_failure(code, format!("request failed: {}", e))
}

/// Send `GET` for the target and return the response status.
///
/// Only the response head is awaited; the body is irrelevant to reachability.
pub async fn get_status<S>(
    stream: S,
    target: &ProbeTarget,
    user_agent: &str,
    form: RequestForm<'_>,
) -> Result<u16, StageFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| http_failure("HTTP_HANDSHAKE_FAILED", e.to_string()))?;
    let _driver = ConnectionTask(tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("HTTP probe connection ended: {}", e);
        }
    }));

    let uri = match form {
        RequestForm::Origin => target.path.clone(),
        RequestForm::Forwarded { .. } => format!("http://{}{}", target.host_header(), target.path),
    };
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(HOST, target.host_header())
        .header(USER_AGENT, user_agent)
        .header(ACCEPT, "*/*")
        .header(CONNECTION, "close");
    if let RequestForm::Forwarded {
        credentials: Some(creds),
    } = form
    {
        request = request.header(PROXY_AUTHORIZATION, basic_auth(creds));
    }
    let request = request
        .body(Empty::<Bytes>::new())
        .map_err(|e| http_failure("HTTP_INVALID_REQUEST", e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| describe_hyper_error(&e))?;

    let status = response.status();
    if matches!(form, RequestForm::Forwarded { .. })
        && status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
    {
        return Err(StageFailure::new(
            Stage::Http,
            ErrorClass::Auth,
            "PROXY_AUTH_REQUIRED",
            "proxy refused to forward the request (407)",
        ));
    }

    Ok(status.as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Read a request head off the server side of a duplex pipe.
    async fn read_request(server: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(server.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_get_status_sends_origin_form() {
        let (client, mut server) = tokio::io::duplex(4096);
        let target = ProbeTarget::parse("http://venue.test:8080/status?q=1").unwrap();

        let server_task = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let status = get_status(client, &target, "egresswatch-test", RequestForm::Origin)
            .await
            .unwrap();
        assert_eq!(status, 204);

        let request = server_task.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /status?q=1 http/1.1\r\n"));
        assert!(request.contains("host: venue.test:8080\r\n"));
        assert!(request.contains("user-agent: egresswatch-test\r\n"));
        assert!(!request.contains("proxy-authorization"));
    }

    #[tokio::test]
    async fn test_get_status_forwarded_form() {
        let (client, mut server) = tokio::io::duplex(4096);
        let target = ProbeTarget::parse("http://venue.test/exchange/status").unwrap();
        let creds = Credentials {
            username: "alice".to_string(),
            password: "pw".to_string(),
        };

        let server_task = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let form = RequestForm::Forwarded {
            credentials: Some(&creds),
        };
        let status = get_status(client, &target, "t", form).await.unwrap();
        assert_eq!(status, 200);

        let request = server_task.await.unwrap();
        assert!(request.starts_with("GET http://venue.test/exchange/status HTTP/1.1\r\n"));
        // base64("alice:pw")
        assert!(request
            .to_ascii_lowercase()
            .contains("proxy-authorization: basic ywxpy2u6chc=\r\n"));
    }

    #[tokio::test]
    async fn test_forwarding_proxy_auth_required() {
        let (client, mut server) = tokio::io::duplex(4096);
        let target = ProbeTarget::parse("http://venue.test/").unwrap();

        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            let response = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                Content-Length: 0\r\n\r\n";
            let _ = server.write_all(response).await;
        });

        let form = RequestForm::Forwarded { credentials: None };
        let err = get_status(client, &target, "t", form).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Auth);
        assert_eq!(err.code, "PROXY_AUTH_REQUIRED");
        assert!(err.http_status.is_none());
    }

    #[tokio::test]
    async fn test_get_status_malformed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let target = ProbeTarget::parse("http://venue.test/").unwrap();

        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            let _ = server.write_all(b"garbage\r\n\r\n").await;
        });

        let err = get_status(client, &target, "t", RequestForm::Origin)
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Http);
        assert_eq!(err.code, "HTTP_MALFORMED_RESPONSE");
    }

    #[tokio::test]
    async fn test_get_status_connection_closed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let target = ProbeTarget::parse("http://venue.test/").unwrap();

        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            drop(server);
        });

        let err = get_status(client, &target, "t", RequestForm::Origin)
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Http);
        assert_eq!(err.stage, Stage::Http);
    }
}
