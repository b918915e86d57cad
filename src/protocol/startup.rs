use std::collections::BTreeMap;

use crate::error::Error;
use crate::protocol::reader::Reader;
use crate::protocol::writer::Writer;

pub const PROTOCOL_VERSION: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

pub const SSL_ALLOWED: u8 = b'S';
pub const SSL_NOT_ALLOWED: u8 = b'N';

pub const DEFAULT_PG_PORT: &str = "5432";

/// A parsed startup message: the full parameter mapping plus the two
/// privileged parameters split out.
#[derive(Debug, Clone)]
pub struct Startup {
    pub params: BTreeMap<String, String>,
    pub user: String,
    pub host: String,
    pub port: String,
    pub database: String,
}

/// Parses a startup parameter list from `r`, whose version field has
/// already been consumed by the caller, and additionally splits and
/// validates `user`/`database` out of the raw parameter map.
pub fn parse(r: &mut Reader) -> Result<Startup, Error> {
    let mut params = BTreeMap::new();
    loop {
        let key = r.read_cstring()?;
        if key.is_empty() {
            r.finalize()?;
            break;
        }
        let value = r.read_cstring()?;
        params.insert(key, value);
    }

    let user = params
        .get("user")
        .cloned()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadStartup("missing or empty 'user' parameter".into()))?;

    let database = params
        .get("database")
        .cloned()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadStartup("missing or empty 'database' parameter".into()))?;

    let (hostspec, realname) = database
        .split_once('/')
        .ok_or_else(|| Error::BadStartup("'database' missing '/' separator".into()))?;

    let (host, port) = split_hostspec(hostspec);

    Ok(Startup {
        params,
        user,
        host,
        port,
        database: realname.to_string(),
    })
}

/// Splits `host` or `host:port` (including bracketed IPv6 forms like
/// `[::1]:5433`) into a host and port, defaulting the port to 5432
/// when absent or unparseable.
fn split_hostspec(hostspec: &str) -> (String, String) {
    if let Some(rest) = hostspec.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':') {
                if !port.is_empty() {
                    return (host.to_string(), port.to_string());
                }
            }
            return (host.to_string(), DEFAULT_PG_PORT.to_string());
        }
    }

    match hostspec.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (host.to_string(), port.to_string())
        }
        _ => (hostspec.to_string(), DEFAULT_PG_PORT.to_string()),
    }
}

/// Emits a rewritten untyped startup message: fixed protocol version,
/// the original parameters with `database` replaced by the real
/// database name, `user` preserved.
pub fn rewrite(startup: &Startup) -> Writer {
    let mut w = Writer::untyped();
    w.write_i32(PROTOCOL_VERSION);
    for (k, v) in &startup.params {
        let value = if k == "database" {
            startup.database.as_str()
        } else {
            v.as_str()
        };
        w.write_cstring(k);
        w.write_cstring(value);
    }
    w.write_u8(0);
    w
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::reader::read_untyped;
    use std::io::Cursor;

    fn frame_startup(pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut w = Writer::untyped();
        w.write_i32(PROTOCOL_VERSION);
        for (k, v) in pairs {
            w.write_cstring(k);
            w.write_cstring(v);
        }
        w.write_u8(0);
        let mut out = Vec::new();
        futures_write_sync(&w, &mut out);
        out
    }

    // test-only synchronous flattening of an async Writer::write_to call
    fn futures_write_sync(w: &Writer, out: &mut Vec<u8>) {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async { w.write_to(out).await.unwrap() });
    }

    async fn parse_bytes(bytes: Vec<u8>) -> Startup {
        let mut cur = Cursor::new(bytes);
        let mut r = read_untyped(&mut cur).await.unwrap();
        let _version = r.read_i32().unwrap();
        parse(&mut r).unwrap()
    }

    #[tokio::test]
    async fn parses_host_no_port_defaults_to_5432() {
        let bytes = frame_startup(&[("user", "alice"), ("database", "db.internal/prod")]);
        let s = parse_bytes(bytes).await;
        assert_eq!(s.host, "db.internal");
        assert_eq!(s.port, "5432");
        assert_eq!(s.database, "prod");
        assert_eq!(s.user, "alice");
    }

    #[tokio::test]
    async fn parses_host_with_port() {
        let bytes = frame_startup(&[("user", "alice"), ("database", "db.internal:5433/prod")]);
        let s = parse_bytes(bytes).await;
        assert_eq!(s.host, "db.internal");
        assert_eq!(s.port, "5433");
    }

    #[tokio::test]
    async fn parses_bracketed_ipv6_with_port() {
        let bytes = frame_startup(&[("user", "alice"), ("database", "[::1]:5433/db")]);
        let s = parse_bytes(bytes).await;
        assert_eq!(s.host, "::1");
        assert_eq!(s.port, "5433");
    }

    #[tokio::test]
    async fn parses_bracketed_ipv6_without_port() {
        let bytes = frame_startup(&[("user", "alice"), ("database", "[::1]/db")]);
        let s = parse_bytes(bytes).await;
        assert_eq!(s.host, "::1");
        assert_eq!(s.port, "5432");
    }

    #[tokio::test]
    async fn missing_slash_is_bad_startup() {
        let mut cur = Cursor::new(frame_startup(&[("user", "alice"), ("database", "nodbhere")]));
        let mut r = read_untyped(&mut cur).await.unwrap();
        let _ = r.read_i32().unwrap();
        let err = parse(&mut r).unwrap_err();
        assert!(matches!(err, Error::BadStartup(_)));
    }

    #[tokio::test]
    async fn missing_user_is_bad_startup() {
        let mut cur = Cursor::new(frame_startup(&[("database", "host/db")]));
        let mut r = read_untyped(&mut cur).await.unwrap();
        let _ = r.read_i32().unwrap();
        let err = parse(&mut r).unwrap_err();
        assert!(matches!(err, Error::BadStartup(_)));
    }

    /// Parses raw key/value pairs without the host/db validation
    /// `parse` applies — the rewritten startup is addressed to the
    /// real backend and no longer carries a `host/db`-shaped database.
    async fn raw_params(bytes: Vec<u8>) -> (i32, BTreeMap<String, String>) {
        let mut cur = Cursor::new(bytes);
        let mut r = read_untyped(&mut cur).await.unwrap();
        let version = r.read_i32().unwrap();
        let mut params = BTreeMap::new();
        loop {
            let key = r.read_cstring().unwrap();
            if key.is_empty() {
                r.finalize().unwrap();
                break;
            }
            let value = r.read_cstring().unwrap();
            params.insert(key, value);
        }
        (version, params)
    }

    #[tokio::test]
    async fn rewrite_preserves_other_params_and_fixes_version() {
        let bytes = frame_startup(&[
            ("user", "alice"),
            ("database", "host:1/prod"),
            ("application_name", "psql"),
        ]);
        let s = parse_bytes(bytes).await;
        let w = rewrite(&s);
        let mut out = Vec::new();
        futures_write_sync(&w, &mut out);

        let (version, params) = raw_params(out).await;
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(params.get("user").unwrap(), "alice");
        assert_eq!(params.get("database").unwrap(), "prod");
        assert_eq!(params.get("application_name").unwrap(), "psql");
        assert_eq!(params.len(), s.params.len());
    }
}
