use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{BackendFacingTls, ClientFacingTls};
use crate::error::Error;
use crate::protocol::startup::{SSL_ALLOWED, SSL_NOT_ALLOWED, SSL_REQUEST_CODE};

/// Either side of a connection, plaintext or TLS-upgraded. The driver
/// only needs `AsyncRead + AsyncWrite + Unpin`, so this enum is kept
/// out of the hot path entirely — it exists only at the two upgrade
/// call sites.
pub enum MaybeTls<T> {
    Plain(T),
    Tls(Box<tokio_rustls::server::TlsStream<T>>),
}

pub enum MaybeTlsClient<T> {
    Plain(T),
    Tls(Box<tokio_rustls::client::TlsStream<T>>),
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTls<T> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTls<T> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsClient<T> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsClient::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            MaybeTlsClient::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsClient<T> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsClient::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            MaybeTlsClient::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsClient::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            MaybeTlsClient::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsClient::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            MaybeTlsClient::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Drives the client-facing SSL negotiation: writes 'S'/'N', and on
/// 'S' performs the server TLS handshake and returns the upgraded
/// transport. On 'N' (or when no server keypair is configured) returns
/// the socket unchanged.
pub async fn accept_from_client(
    socket: TcpStream,
    tls: &ClientFacingTls,
) -> Result<MaybeTls<TcpStream>, Error> {
    let mut socket = socket;
    match &tls.server_config {
        Some(server_config) => {
            socket.write_all(&[SSL_ALLOWED]).await?;
            let acceptor = TlsAcceptor::from(server_config.clone());
            let tls_stream = acceptor.accept(socket).await.map_err(|e| {
                Error::Tls(format!("client TLS handshake failed: {}", e))
            })?;
            Ok(MaybeTls::Tls(Box::new(tls_stream)))
        }
        None => {
            socket.write_all(&[SSL_NOT_ALLOWED]).await?;
            Ok(MaybeTls::Plain(socket))
        }
    }
}

/// After a client skips SSL, decides whether the non-SSL startup must
/// be rejected. Takes the policy inputs directly (rather than the
/// whole `ClientFacingTls`) so the decision can be unit-tested without
/// constructing a real `rustls::ServerConfig`.
pub fn must_reject_non_ssl(tls_configured: bool, allow_unencrypted: bool, is_cancel: bool) -> bool {
    tls_configured && !allow_unencrypted && !is_cancel
}

/// Dials `host:port` and, if configured, negotiates SSL with the
/// backend. Only a literal 'S' is treated as an allow; any other byte
/// (including 'N') is a refusal.
pub async fn connect_to_backend(
    host: &str,
    port: &str,
    tls: &BackendFacingTls,
) -> Result<MaybeTlsClient<TcpStream>, Error> {
    let addr = format!("{}:{}", host, port);
    let socket = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::BackendUnreachable(format!("{}: {}", addr, e)))?;

    if !tls.try_ssl {
        return Ok(MaybeTlsClient::Plain(socket));
    }

    let mut socket = socket;
    let mut w = crate::protocol::Writer::untyped();
    w.write_i32(SSL_REQUEST_CODE);
    w.write_to(&mut socket)
        .await
        .map_err(|e| Error::BackendUnreachable(format!("sending SSLRequest: {}", e)))?;

    let mut response = [0u8; 1];
    socket
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::BackendUnreachable(format!("reading SSL response: {}", e)))?;

    if response[0] != SSL_ALLOWED {
        if tls.allow_unencrypted {
            return Ok(MaybeTlsClient::Plain(socket));
        }
        return Err(Error::BackendUnreachable(
            "backend refused SSL and allowunencrypted is false".into(),
        ));
    }

    let server_name = rustls::ServerName::try_from(host)
        .map_err(|e| Error::Tls(format!("invalid backend hostname {}: {}", host, e)))?;
    let connector = TlsConnector::from(tls.client_config.clone());
    let tls_stream = connector
        .connect(server_name, socket)
        .await
        .map_err(|e| Error::BackendUnreachable(format!("backend TLS handshake failed: {}", e)))?;

    Ok(MaybeTlsClient::Tls(Box::new(tls_stream)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_policy_exempts_cancel_request() {
        assert!(!must_reject_non_ssl(true, false, true));
    }

    #[test]
    fn reject_policy_rejects_plain_startup_when_tls_required() {
        assert!(must_reject_non_ssl(true, false, false));
    }

    #[test]
    fn reject_policy_allows_when_allow_unencrypted_true() {
        assert!(!must_reject_non_ssl(true, true, false));
    }

    #[test]
    fn reject_policy_allows_when_no_tls_configured() {
        assert!(!must_reject_non_ssl(false, false, false));
    }
}
