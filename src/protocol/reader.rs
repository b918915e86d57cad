use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Reads one framed PostgreSQL message body and enforces that handlers
/// consume exactly the bytes the frame promised.
///
/// Construct via [`read_typed`] or [`read_untyped`]. The returned
/// `Reader` limits all reads to the frame's declared length; calling
/// [`Reader::finalize`] after under-reading is a protocol error, and
/// over-reading returns an `UnexpectedEof`-flavored `Error::Io`.
pub struct Reader {
    pub msg_type: Option<u8>,
    buf: Vec<u8>,
    pos: usize,
}

impl Reader {
    /// Wraps an already-read, already-framed message body (the type
    /// tag and length prefix have been consumed and verified by the
    /// caller) so it can be parsed with the same handler functions
    /// `read_typed`/`read_untyped` produce a `Reader` for.
    pub fn from_body(buf: Vec<u8>) -> Reader {
        Reader {
            msg_type: None,
            buf,
            pos: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&[u8], Error> {
        if self.remaining() < n {
            return Err(Error::Protocol("message body shorter than read".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    /// Reads bytes up to and including the next NUL, returning the
    /// string without the terminator.
    pub fn read_cstring(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while self.pos < self.buf.len() {
            if self.buf[self.pos] == 0 {
                let s = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err(Error::Protocol("unterminated string in message".into()))
    }

    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        rest
    }

    /// Fails if any bytes remain unread. Use after a handler believes
    /// it has parsed the entire message body.
    pub fn finalize(&self) -> Result<(), Error> {
        if self.remaining() != 0 {
            return Err(Error::Protocol(format!(
                "{} unread bytes left at finalize",
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Total frame length as it appeared on the wire (4-byte length
    /// prefix plus body), regardless of how much has been consumed.
    pub fn frame_len(&self) -> usize {
        self.buf.len() + 4
    }

    /// Drains remaining bytes without inspecting them. Used by
    /// handlers that intentionally skip a trailing section (e.g. the
    /// result-format array in Bind/Parse/FunctionCall).
    pub fn discard(&mut self) {
        self.pos = self.buf.len();
    }
}

async fn read_len_prefixed<T: AsyncRead + Unpin>(
    transport: &mut T,
    prefix: Option<u8>,
) -> Result<Reader, Error> {
    let mut len_bytes = [0u8; 4];
    transport.read_exact(&mut len_bytes).await?;
    let len = i32::from_be_bytes(len_bytes);
    if len < 4 {
        return Err(Error::Protocol(format!("message length {} < 4", len)));
    }
    let body_len = (len - 4) as usize;
    let mut buf = vec![0u8; body_len];
    transport.read_exact(&mut buf).await?;
    Ok(Reader {
        msg_type: prefix,
        buf,
        pos: 0,
    })
}

/// Reads an untyped message: a 4-byte length followed by its payload.
/// Used only for the startup preamble and CancelRequest.
pub async fn read_untyped<T: AsyncRead + Unpin>(transport: &mut T) -> Result<Reader, Error> {
    read_len_prefixed(transport, None).await
}

/// Reads a typed message: a 1-byte tag, then the same length-prefixed
/// framing as [`read_untyped`]. Used for all post-startup messages.
pub async fn read_typed<T: AsyncRead + Unpin>(transport: &mut T) -> Result<Reader, Error> {
    let mut tag = [0u8; 1];
    transport.read_exact(&mut tag).await?;
    read_len_prefixed(transport, Some(tag[0])).await
}
