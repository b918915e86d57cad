use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::cancel::CancelRegistry;
use crate::classify;
use crate::config::Config;
use crate::error::Error;
use crate::protocol::startup::{self, CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE};
use crate::protocol::{read_untyped, write_error_response, Reader, Writer};
use crate::tls::{self, MaybeTls, MaybeTlsClient};

/// One instance per accepted client socket. Owns the client socket
/// exclusively and, once dialed, the backend socket; both are closed
/// unconditionally on termination (Rust's drop glue gives this for
/// free, unlike an explicit `defer`).
pub struct ConnectionDriver {
    config: Arc<Config>,
    registry: Arc<CancelRegistry>,
    remote_addr: String,
}

impl ConnectionDriver {
    pub fn new(config: Arc<Config>, registry: Arc<CancelRegistry>, remote_addr: String) -> Self {
        ConnectionDriver {
            config,
            registry,
            remote_addr,
        }
    }

    pub async fn run(self, socket: TcpStream) {
        log::info!("{}: accepted connection", self.remote_addr);
        match self.handle(socket).await {
            Ok(()) => log::info!("{}: connection closed", self.remote_addr),
            Err(e) => log::info!("{}: connection closed with error: {}", self.remote_addr, e),
        }
    }

    async fn handle(&self, socket: TcpStream) -> Result<(), Error> {
        let mut client = MaybeTls::Plain(socket);

        let (version, mut reader) = match read_version(&mut client).await? {
            Some(v) => v,
            None => return Ok(()),
        };

        if version == SSL_REQUEST_CODE {
            reader.finalize()?;
            let socket = match client {
                MaybeTls::Plain(s) => s,
                MaybeTls::Tls(_) => unreachable!("SSL request arrives before any upgrade"),
            };
            client = match tls::accept_from_client(socket, &self.config.server_tls).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    log::warn!("{}: SSL handshake failed: {}", self.remote_addr, e);
                    return Err(e);
                }
            };

            let (v2, r2) = match read_version(&mut client).await? {
                Some(v) => v,
                None => {
                    log::info!("{}: client closed after SSL response", self.remote_addr);
                    return Ok(());
                }
            };
            return self.route(client, v2, r2).await;
        }

        let is_cancel = version == CANCEL_REQUEST_CODE;
        if tls::must_reject_non_ssl(
            self.config.server_tls.server_config.is_some(),
            self.config.server_tls.allow_unencrypted,
            is_cancel,
        ) {
            write_error_response(
                &mut client,
                "FATAL",
                "08004",
                "SSL required by this proxy",
            )
            .await?;
            return Err(Error::PolicyRejected("client skipped required SSL".into()));
        }

        self.route(client, version, reader).await
    }

    async fn route(
        &self,
        mut client: MaybeTls<TcpStream>,
        version: i32,
        mut reader: Reader,
    ) -> Result<(), Error> {
        if version == CANCEL_REQUEST_CODE {
            return self.handle_cancel(&mut reader).await;
        }

        if version != PROTOCOL_VERSION {
            let msg = format!("unsupported protocol version {}", version);
            write_error_response(&mut client, "FATAL", "08006", &msg).await?;
            return Err(Error::BadStartup(msg));
        }

        let startup = match startup::parse(&mut reader) {
            Ok(s) => s,
            Err(e) => {
                write_error_response(&mut client, "FATAL", e.sqlstate(), &e.to_string()).await?;
                return Err(e);
            }
        };

        if let Some(re) = &self.config.host_filter {
            if !re.is_match(&startup.host) {
                let msg = format!("backend host {} rejected by policy", startup.host);
                write_error_response(&mut client, "FATAL", "08004", &msg).await?;
                return Err(Error::PolicyRejected(msg));
            }
        }

        log::info!(
            "{}: connecting to backend {}:{} user={} database={}",
            self.remote_addr,
            startup.host,
            startup.port,
            startup.user,
            startup.database,
        );

        let backend = match tls::connect_to_backend(&startup.host, &startup.port, &self.config.client_tls)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                write_error_response(&mut client, "FATAL", e.sqlstate(), &e.to_string()).await?;
                return Err(e);
            }
        };

        self.proxy_session(client, backend, startup).await
    }

    async fn handle_cancel(&self, reader: &mut Reader) -> Result<(), Error> {
        let pid = reader.read_i32()?;
        let secret = reader.read_i32()?;
        reader.finalize()?;

        let Some(record) = self.registry.get(pid, secret) else {
            log::debug!(
                "{}: CancelRequest for unknown (pid={}, secret={}) — ignoring",
                self.remote_addr,
                pid,
                secret
            );
            return Ok(());
        };

        log::info!(
            "{}: routing CancelRequest(pid={}) to {}:{}",
            self.remote_addr,
            pid,
            record.host,
            record.port
        );

        let mut backend = TcpStream::connect(format!("{}:{}", record.host, record.port))
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        let mut w = Writer::untyped();
        w.write_i32(CANCEL_REQUEST_CODE);
        w.write_i32(pid);
        w.write_i32(record.original_secret);
        w.write_to(&mut backend).await?;

        Ok(())
    }

    async fn proxy_session(
        &self,
        client: MaybeTls<TcpStream>,
        backend: MaybeTlsClient<TcpStream>,
        startup: startup::Startup,
    ) -> Result<(), Error> {
        let rewritten = startup::rewrite(&startup);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend);

        rewritten.write_to(&mut backend_write).await?;

        let registry = self.registry.clone();
        let remote_addr = self.remote_addr.clone();
        let host = startup.host.clone();
        let port = startup.port.clone();

        // Tracked outside the interceptor future itself so that a
        // registered cancel key is still visible to us for cleanup
        // even if the interceptor (or its sibling forwarder) exits
        // with an error partway through the session.
        let registered: Arc<parking_lot::Mutex<Option<(i32, i32)>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let server_to_client = intercept_backend_key_data(
            &mut backend_read,
            &mut client_write,
            registry.clone(),
            host,
            port,
            remote_addr.clone(),
            registered.clone(),
        );

        let client_to_server = log_and_forward(&mut client_read, &mut backend_write, remote_addr);

        let result = tokio::try_join!(server_to_client, client_to_server).map(|_| ());

        if let Some((pid, assigned)) = registered.lock().take() {
            self.registry.remove(pid, assigned);
        }

        result
    }
}

/// Reads the client's first untyped message and extracts its version
/// code. Returns `None` on a clean EOF, which is a normal end-of-session
/// rather than an error.
async fn read_version<T: AsyncRead + Unpin>(
    transport: &mut T,
) -> Result<Option<(i32, Reader)>, Error> {
    match read_untyped(transport).await {
        Ok(mut r) => {
            let version = r.read_i32()?;
            Ok(Some((version, r)))
        }
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// The server→client interceptor: parses each message individually
/// until the first `ReadyForQuery`, rewriting `BackendKeyData` along the way, then
/// falls back to a raw byte copy for the rest of the session. Records
/// any `(pid, assigned_secret)` it registers into `registered_cell` so
/// the caller can remove it on driver termination even if this future
/// (or its sibling forwarder) later exits with an error.
async fn intercept_backend_key_data<R, W>(
    backend_read: &mut R,
    client_write: &mut W,
    registry: Arc<CancelRegistry>,
    host: String,
    port: String,
    remote_addr: String,
    registered_cell: Arc<parking_lot::Mutex<Option<(i32, i32)>>>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut tag = [0u8; 1];
        match backend_read.read_exact(&mut tag).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        client_write.write_all(&tag).await?;

        let mut len_bytes = [0u8; 4];
        backend_read.read_exact(&mut len_bytes).await?;
        let len = i32::from_be_bytes(len_bytes);
        if len < 4 {
            return Err(Error::Protocol(format!("backend frame length {} < 4", len)));
        }
        let mut body = vec![0u8; (len - 4) as usize];
        backend_read.read_exact(&mut body).await?;

        if tag[0] == b'K' {
            let mut r = Reader::from_body(body);
            let pid = r.read_i32()?;
            let secret = r.read_i32()?;
            r.finalize()?;

            if let Some((old_pid, old_assigned)) = registered_cell.lock().take() {
                registry.remove(old_pid, old_assigned);
            }

            let assigned = registry.add(pid, secret, host.clone(), port.clone());
            *registered_cell.lock() = Some((pid, assigned));

            log::debug!(
                "{}: BackendKeyData pid={} assigned_secret={}",
                remote_addr,
                pid,
                assigned
            );

            let mut out = Vec::with_capacity(12);
            out.extend_from_slice(&12i32.to_be_bytes());
            out.extend_from_slice(&pid.to_be_bytes());
            out.extend_from_slice(&assigned.to_be_bytes());
            client_write.write_all(&out).await?;
        } else {
            client_write.write_all(&len_bytes).await?;
            client_write.write_all(&body).await?;
        }

        if tag[0] == b'Z' {
            break;
        }
    }

    tokio::io::copy(backend_read, client_write).await?;
    Ok(())
}

/// The client→server forwarder: a tee reader mirrors every consumed
/// byte into the backend socket, so forwarding is a side effect of
/// parsing and never lags it.
async fn log_and_forward<R, W>(client_read: &mut R, backend_write: &mut W, remote_addr: String) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut tag = [0u8; 1];
        match client_read.read_exact(&mut tag).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        backend_write.write_all(&tag).await?;

        let mut len_bytes = [0u8; 4];
        client_read.read_exact(&mut len_bytes).await?;
        backend_write.write_all(&len_bytes).await?;
        let len = i32::from_be_bytes(len_bytes);
        if len < 4 {
            return Err(Error::Protocol(format!("client frame length {} < 4", len)));
        }
        let mut body = vec![0u8; (len - 4) as usize];
        client_read.read_exact(&mut body).await?;
        backend_write.write_all(&body).await?;

        let mut r = Reader::from_body(body);
        match classify::classify(tag[0], len as usize, &mut r) {
            Ok(record) => log::info!("{}: {}", remote_addr, record),
            Err(e) => log::warn!("{}: failed to classify message type {}: {}", remote_addr, tag[0] as char, e),
        }

        if tag[0] == b'X' {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_version_returns_none_on_clean_eof() {
        let mut cur = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_version(&mut cur).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_version_reads_protocol_version() {
        let mut w = Writer::untyped();
        w.write_i32(PROTOCOL_VERSION);
        let mut out = Vec::new();
        w.write_to(&mut out).await.unwrap();
        let mut cur = std::io::Cursor::new(out);
        let (version, _) = read_version(&mut cur).await.unwrap().unwrap();
        assert_eq!(version, PROTOCOL_VERSION);
    }
}
