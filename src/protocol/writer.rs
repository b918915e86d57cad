use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Accumulates a message payload in memory, then emits
/// `[optional tag][length][payload]` to a transport in one write.
///
/// Grounded on pgcat's `messages::*` helpers (`auth_ok`,
/// `backend_key_data`, `startup`), generalized here into a reusable
/// builder instead of one hand-written function per message shape.
pub struct Writer {
    tag: Option<u8>,
    body: BytesMut,
}

impl Writer {
    pub fn untyped() -> Self {
        Writer {
            tag: None,
            body: BytesMut::new(),
        }
    }

    pub fn typed(tag: u8) -> Self {
        Writer {
            tag: Some(tag),
            body: BytesMut::new(),
        }
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.body.put_i32(v);
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.body.put_i16(v);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.body.put_u8(v);
        self
    }

    pub fn write_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.body.put_slice(b);
        self
    }

    /// Appends `s` followed by a terminating NUL, as every string in
    /// the wire protocol requires.
    pub fn write_cstring(&mut self, s: &str) -> &mut Self {
        self.body.put_slice(s.as_bytes());
        self.body.put_u8(0);
        self
    }

    fn encode(&self) -> Result<BytesMut, Error> {
        let len = self.body.len() + 4;
        if len > i32::MAX as usize {
            return Err(Error::Protocol("message body too large to frame".into()));
        }
        let mut out = BytesMut::with_capacity(len + 1);
        if let Some(tag) = self.tag {
            out.put_u8(tag);
        }
        out.put_i32(len as i32);
        out.put_slice(&self.body);
        Ok(out)
    }

    pub async fn write_to<T: AsyncWrite + Unpin>(&self, transport: &mut T) -> Result<(), Error> {
        let out = self.encode()?;
        transport.write_all(&out).await?;
        Ok(())
    }
}

/// Writes a PostgreSQL `ErrorResponse` ('E') with the given severity,
/// SQLSTATE, and message. Used for every startup-phase failure the
/// driver can still report on.
pub async fn write_error_response<T: AsyncWrite + Unpin>(
    transport: &mut T,
    severity: &str,
    code: &str,
    message: &str,
) -> Result<(), Error> {
    let mut w = Writer::typed(b'E');
    w.write_u8(b'S').write_cstring(severity);
    w.write_u8(b'C').write_cstring(code);
    w.write_u8(b'M').write_cstring(message);
    w.write_u8(0);
    w.write_to(transport).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn untyped_length_is_payload_plus_four() {
        let mut w = Writer::untyped();
        w.write_i32(196608);
        let mut out = Vec::new();
        w.write_to(&mut out).await.unwrap();
        let len = i32::from_be_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(len as usize, out.len());
        assert_eq!(len, 8);
    }

    #[tokio::test]
    async fn typed_message_has_leading_tag() {
        let mut w = Writer::typed(b'Z');
        w.write_u8(b'I');
        let mut out = Vec::new();
        w.write_to(&mut out).await.unwrap();
        assert_eq!(out[0], b'Z');
        let len = i32::from_be_bytes([out[1], out[2], out[3], out[4]]);
        assert_eq!(len as usize, out.len() - 1);
    }

    #[tokio::test]
    async fn error_response_roundtrips_through_reader() {
        let mut out = Vec::new();
        write_error_response(&mut out, "FATAL", "08004", "nope")
            .await
            .unwrap();
        assert_eq!(out[0], b'E');
    }
}
