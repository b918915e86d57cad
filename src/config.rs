use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde_derive::Deserialize;
use tokio_rustls::rustls;

use crate::error::Error;

/// On-disk shape, deserialized directly from TOML: the untrusted
/// file-shaped struct. [`Config`] is what the rest of the proxy
/// actually uses.
#[derive(Debug, Deserialize)]
struct RawConfig {
    bind: String,
    hostregex: Option<String>,
    #[serde(default)]
    server: RawServerTls,
    #[serde(default)]
    client: RawClientTls,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerTls {
    cert: Option<String>,
    key: Option<String>,
    ca: Option<String>,
    #[serde(default)]
    allowunencrypted: bool,
}

#[derive(Debug, Deserialize)]
struct RawClientTls {
    cert: Option<String>,
    key: Option<String>,
    ca: Option<String>,
    #[serde(default = "default_true")]
    allowunencrypted: bool,
    #[serde(default = "default_true")]
    tryssl: bool,
}

impl Default for RawClientTls {
    fn default() -> Self {
        RawClientTls {
            cert: None,
            key: None,
            ca: None,
            allowunencrypted: true,
            tryssl: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Client-facing TLS policy. `server_config` is `None` when no keypair
/// was configured, meaning the proxy never offers TLS to clients.
pub struct ClientFacingTls {
    pub allow_unencrypted: bool,
    pub server_config: Option<Arc<rustls::ServerConfig>>,
}

/// Backend-facing TLS policy.
pub struct BackendFacingTls {
    pub allow_unencrypted: bool,
    pub try_ssl: bool,
    pub client_config: Arc<rustls::ClientConfig>,
}

/// Fully validated, ready-to-run configuration.
pub struct Config {
    pub bind: String,
    pub host_filter: Option<Regex>,
    pub server_tls: ClientFacingTls,
    pub client_tls: BackendFacingTls,
}

fn load_certs(path: &str) -> Result<Vec<rustls::Certificate>, Error> {
    let file = std::fs::File::open(path).map_err(|e| Error::Tls(format!("{}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::Tls(format!("{}: {}", path, e)))?;
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &str) -> Result<rustls::PrivateKey, Error> {
    let file = std::fs::File::open(path).map_err(|e| Error::Tls(format!("{}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::Tls(format!("{}: {}", path, e)))?;
    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| Error::Tls(format!("{}: no private key found", path)))
}

fn build_server_tls(raw: &RawServerTls) -> Result<Option<Arc<rustls::ServerConfig>>, Error> {
    let (cert_path, key_path) = match (&raw.cert, &raw.key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => return Ok(None),
        _ => {
            return Err(Error::Config(
                "server.cert and server.key must both be set or both absent".into(),
            ))
        }
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder().with_safe_defaults();

    let builder = if let Some(ca_path) = &raw.ca {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(&cert)
                .map_err(|e| Error::Tls(format!("bad CA cert in {}: {}", ca_path, e)))?;
        }
        let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
        builder.with_client_cert_verifier(Arc::new(verifier))
    } else {
        builder.with_no_client_auth()
    };

    let cfg = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid server keypair: {}", e)))?;

    Ok(Some(Arc::new(cfg)))
}

fn build_client_tls(raw: &RawClientTls) -> Result<Arc<rustls::ClientConfig>, Error> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca_path) = &raw.ca {
        for cert in load_certs(ca_path)? {
            roots
                .add(&cert)
                .map_err(|e| Error::Tls(format!("bad CA cert in {}: {}", ca_path, e)))?;
        }
    }

    let builder = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);

    let cfg = match (&raw.cert, &raw.key) {
        (Some(c), Some(k)) => {
            let certs = load_certs(c)?;
            let key = load_private_key(k)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Tls(format!("invalid client keypair: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(cfg))
}

impl Config {
    /// Loads and validates a TOML config file from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        let raw: RawConfig = toml::from_str(&text)?;

        let host_filter = raw
            .hostregex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Config(format!("invalid hostregex: {}", e)))?;

        let server_config = build_server_tls(&raw.server)?;
        if server_config.is_none() && !raw.server.allowunencrypted {
            return Err(Error::Config(
                "server.allowunencrypted is false but no server TLS keypair is configured".into(),
            ));
        }

        let client_config = build_client_tls(&raw.client)?;

        Ok(Config {
            bind: raw.bind,
            host_filter,
            server_tls: ClientFacingTls {
                allow_unencrypted: raw.server.allowunencrypted,
                server_config,
            },
            client_tls: BackendFacingTls {
                allow_unencrypted: raw.client.allowunencrypted,
                try_ssl: raw.client.tryssl,
                client_config,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_server_allowunencrypted_false_without_keypair() {
        let mut f = tempfile_toml(
            r#"
            bind = "0.0.0.0:6432"
            [server]
            allowunencrypted = false
            "#,
        );
        let err = Config::load(f.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        f.flush().unwrap();
    }

    #[test]
    fn defaults_client_tryssl_and_allowunencrypted_true() {
        let f = tempfile_toml(
            r#"
            bind = "0.0.0.0:6432"
            [server]
            allowunencrypted = true
            "#,
        );
        let cfg = Config::load(f.path()).unwrap();
        assert!(cfg.client_tls.try_ssl);
        assert!(cfg.client_tls.allow_unencrypted);
        assert!(cfg.server_tls.server_config.is_none());
        assert!(cfg.host_filter.is_none());
    }

    #[test]
    fn parses_hostregex() {
        let f = tempfile_toml(
            r#"
            bind = "0.0.0.0:6432"
            hostregex = "^db\\d*\\.internal$"
            [server]
            allowunencrypted = true
            "#,
        );
        let cfg = Config::load(f.path()).unwrap();
        let re = cfg.host_filter.unwrap();
        assert!(re.is_match("db1.internal"));
        assert!(!re.is_match("evil.example"));
    }

    fn tempfile_toml(contents: &str) -> tempfile_shim::NamedTempFile {
        let mut f = tempfile_shim::NamedTempFile::new();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    /// Minimal drop-to-delete tempfile, avoiding an extra dev-dependency.
    mod tempfile_shim {
        use std::fs::File;
        use std::io::Write;
        use std::path::{Path, PathBuf};

        pub struct NamedTempFile {
            path: PathBuf,
            file: File,
        }

        impl NamedTempFile {
            pub fn new() -> Self {
                let path = std::env::temp_dir().join(format!(
                    "pg-jump-test-{}-{}.toml",
                    std::process::id(),
                    COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                ));
                let file = File::create(&path).unwrap();
                NamedTempFile { path, file }
            }

            pub fn path(&self) -> &Path {
                &self.path
            }
        }

        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

        impl Write for NamedTempFile {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.file.write(buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                self.file.flush()
            }
        }

        impl Drop for NamedTempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}
