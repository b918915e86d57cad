use crate::error::Error;
use crate::protocol::Reader;

/// A single parsed argument from Bind/FunctionCall's tabulated
/// argument list.
#[derive(Debug)]
pub struct PgArg {
    pub fmt: &'static str,
    pub value: String,
}

/// Reads the C-count format-code array followed by the N-count
/// (length, bytes) value array shared by Bind and FunctionCall.
/// Applies the last format code when the code array is shorter than
/// the value array; length -1 denotes NULL; binary values are
/// hex-encoded.
fn read_args(r: &mut Reader) -> Result<Vec<PgArg>, Error> {
    let fmt_count = r.read_i16()? as usize;
    let mut fmt_codes = Vec::with_capacity(fmt_count);
    for _ in 0..fmt_count {
        fmt_codes.push(r.read_i16()?);
    }
    let last_fmt_code = fmt_codes.last().copied().unwrap_or(0);

    let arg_count = r.read_i16()? as usize;
    let mut args = Vec::with_capacity(arg_count);
    for i in 0..arg_count {
        let len = r.read_i32()?;
        if len == -1 {
            args.push(PgArg {
                fmt: "null",
                value: String::new(),
            });
            continue;
        }
        let bytes = r.read_exact(len as usize)?;
        let code = fmt_codes.get(i).copied().unwrap_or(last_fmt_code);
        let (fmt, value) = match code {
            0 => ("text", String::from_utf8_lossy(&bytes).into_owned()),
            _ => ("binary", hex_encode(&bytes)),
        };
        args.push(PgArg { fmt, value });
    }
    Ok(args)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A structured record describing one frontend message, for
/// observability.
#[derive(Debug)]
pub struct LogRecord {
    pub kind: &'static str,
    pub fields: Vec<(&'static str, String)>,
}

impl LogRecord {
    fn new(kind: &'static str) -> Self {
        LogRecord {
            kind,
            fields: Vec::new(),
        }
    }

    fn field(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((name, value.into()));
        self
    }
}

impl std::fmt::Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        for (name, value) in &self.fields {
            write!(f, " {}={}", name, value)?;
        }
        Ok(())
    }
}

/// Parses one already-framed frontend message body and produces a
/// structured log record. `finalize`s exact-length messages and
/// `discard`s messages with a trailing section the classifier
/// intentionally skips. Unknown types log their type code and length,
/// then discard.
pub fn classify(msg_type: u8, len: usize, r: &mut Reader) -> Result<LogRecord, Error> {
    let record = match msg_type {
        b'd' => {
            // CopyData: opaque bytes, hex-encoded for the log.
            let bytes = r.read_remaining();
            r.finalize()?;
            LogRecord::new("CopyData").field("bytes", hex_encode(&bytes))
        }
        b'c' => {
            r.finalize()?;
            LogRecord::new("CopyDone")
        }
        b'f' => {
            let msg = r.read_cstring()?;
            r.finalize()?;
            LogRecord::new("CopyFail").field("errorMessage", msg)
        }
        b'B' => {
            let portal = r.read_cstring()?;
            let _stmt = r.read_cstring()?;
            let args = read_args(r)?;
            r.discard();
            LogRecord::new("Bind")
                .field("portal", portal)
                .field("args", format!("{:?}", args))
        }
        b'C' => {
            let target = match r.read_u8()? {
                b'S' => "prepared",
                b'P' => "portal",
                _ => "unknown",
            };
            let name = r.read_cstring()?;
            r.finalize()?;
            LogRecord::new("Close").field("target", target).field("name", name)
        }
        b'D' => {
            let target = match r.read_u8()? {
                b'S' => "prepared",
                b'P' => "portal",
                _ => "unknown",
            };
            let name = r.read_cstring()?;
            r.finalize()?;
            LogRecord::new("Describe")
                .field("target", target)
                .field("name", name)
        }
        b'E' => {
            let portal = r.read_cstring()?;
            let max_rows = r.read_i32()?;
            r.finalize()?;
            LogRecord::new("Execute")
                .field("portalName", portal)
                .field("maxRows", max_rows.to_string())
        }
        b'Q' => {
            let query = r.read_cstring()?;
            r.finalize()?;
            LogRecord::new("SimpleQuery").field("query", query)
        }
        b'P' => {
            let stmt = r.read_cstring()?;
            let query = r.read_cstring()?;
            r.discard();
            LogRecord::new("Parse")
                .field("preparedStatement", stmt)
                .field("query", query)
        }
        b'F' => {
            let oid = r.read_i32()?;
            let args = read_args(r)?;
            r.discard();
            LogRecord::new("FunctionCall")
                .field("funcOID", oid.to_string())
                .field("args", format!("{:?}", args))
        }
        b'S' => {
            r.finalize()?;
            LogRecord::new("Sync")
        }
        b'X' => {
            r.finalize()?;
            LogRecord::new("Terminate")
        }
        other => {
            r.discard();
            LogRecord::new("Unknown")
                .field("type", (other as char).to_string())
                .field("length", len.to_string())
        }
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::writer::Writer;

    async fn framed_body(w: Writer) -> (u8, usize, Reader) {
        let mut out = Vec::new();
        w.write_to(&mut out).await.unwrap();
        let mut cur = std::io::Cursor::new(out);
        let r = crate::protocol::read_typed(&mut cur).await.unwrap();
        let len = r.frame_len();
        let msg_type = r.msg_type.unwrap();
        (msg_type, len, r)
    }

    #[tokio::test]
    async fn simple_query_finalizes() {
        let mut w = Writer::typed(b'Q');
        w.write_cstring("select 1");
        let (t, len, mut r) = framed_body(w).await;
        let rec = classify(t, len, &mut r).unwrap();
        assert_eq!(rec.kind, "SimpleQuery");
        assert_eq!(rec.fields[0], ("query", "select 1".to_string()));
    }

    #[tokio::test]
    async fn terminate_and_sync_are_exact_length() {
        let (t, len, mut r) = framed_body(Writer::typed(b'X')).await;
        let rec = classify(t, len, &mut r).unwrap();
        assert_eq!(rec.kind, "Terminate");

        let (t, len, mut r) = framed_body(Writer::typed(b'S')).await;
        let rec = classify(t, len, &mut r).unwrap();
        assert_eq!(rec.kind, "Sync");
    }

    #[tokio::test]
    async fn bind_discards_trailing_result_format_array() {
        let mut w = Writer::typed(b'B');
        w.write_cstring(""); // portal
        w.write_cstring(""); // statement
        w.write_i16(0); // no format codes
        w.write_i16(1); // one arg
        w.write_i32(-1); // NULL
        w.write_i16(2); // two trailing result-format codes we intentionally discard
        w.write_i16(0);
        w.write_i16(1);
        let (t, len, mut r) = framed_body(w).await;
        let rec = classify(t, len, &mut r).unwrap();
        assert_eq!(rec.kind, "Bind");
        assert!(rec.fields[1].1.contains("null"));
    }

    #[tokio::test]
    async fn unknown_type_discards_and_logs_code() {
        let mut w = Writer::typed(b'!');
        w.write_bytes(&[1, 2, 3]);
        let (t, len, mut r) = framed_body(w).await;
        let rec = classify(t, len, &mut r).unwrap();
        assert_eq!(rec.kind, "Unknown");
    }

    #[tokio::test]
    async fn args_apply_last_format_code_when_codes_shorter_than_values() {
        let mut w = Writer::typed(b'F');
        w.write_i32(0); // funcOID
        w.write_i16(1); // one format code
        w.write_i16(1); // binary
        w.write_i16(2); // two args
        w.write_i32(2);
        w.write_bytes(&[0xAB, 0xCD]);
        w.write_i32(1);
        w.write_bytes(&[0xEF]);
        w.write_i16(0); // result format code
        let (t, len, mut r) = framed_body(w).await;
        let rec = classify(t, len, &mut r).unwrap();
        assert_eq!(rec.kind, "FunctionCall");
        assert!(rec.fields[1].1.contains("abcd"));
        assert!(rec.fields[1].1.contains("ef"));
    }
}
