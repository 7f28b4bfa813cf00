//! Wire messages of the fstat cache service.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload
//!
//! One exchange:
//!
//! ```text
//! client: QUERY
//! server: RESPONSE, RECORDS*, DONE      (or FATAL)
//! ```
//!
//! A connection may carry any number of exchanges.

use crate::error::SyncError;
use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Record lines carried per RECORDS frame
pub const RECORDS_PER_FRAME: usize = 4096;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Query = 0x01,
    Response = 0x02,
    Records = 0x03,
    Done = 0x04,
    Fatal = 0x0E,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Query),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Records),
            0x04 => Some(Self::Done),
            0x0E => Some(Self::Fatal),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: u8 {
        const CREDENTIALS = 1 << 0;
    }
}

fn truncated(what: &str) -> anyhow::Error {
    SyncError::Protocol(format!("{} payload truncated", what)).into()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(truncated(what));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(truncated(what));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::Protocol(format!("invalid UTF-8 in {}", what)).into())
}

fn check_str(s: &str, what: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(SyncError::Protocol(format!("{} longer than {} bytes", what, u16::MAX)).into());
    }
    Ok(())
}

fn frame(msg_type: MessageType, body: BytesMut) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(&body);
    buf.freeze()
}

// =============================================================================
// QUERY (0x01)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub version: u16,
    pub prefix: String,
    pub from: u64,
    pub to: u64,
    pub credentials: Option<Credentials>,
}

impl Query {
    pub fn new(prefix: impl Into<String>, from: u64, to: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            prefix: prefix.into(),
            from,
            to,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn encode(&self) -> Result<Bytes> {
        check_str(&self.prefix, "prefix")?;
        let mut flags = QueryFlags::empty();
        if self.credentials.is_some() {
            flags |= QueryFlags::CREDENTIALS;
        }

        let mut body = BytesMut::new();
        body.put_u16(self.version);
        body.put_u8(flags.bits());
        put_str(&mut body, &self.prefix);
        body.put_u64(self.from);
        body.put_u64(self.to);
        if let Some(creds) = &self.credentials {
            check_str(&creds.username, "username")?;
            check_str(&creds.password, "password")?;
            put_str(&mut body, &creds.username);
            put_str(&mut body, &creds.password);
        }
        Ok(frame(MessageType::Query, body))
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 3 {
            return Err(truncated("Query"));
        }
        let version = payload.get_u16();
        let flags = QueryFlags::from_bits_truncate(payload.get_u8());
        let prefix = get_str(&mut payload, "Query prefix")?;
        if payload.remaining() < 16 {
            return Err(truncated("Query"));
        }
        let from = payload.get_u64();
        let to = payload.get_u64();
        let credentials = if flags.contains(QueryFlags::CREDENTIALS) {
            Some(Credentials {
                username: get_str(&mut payload, "Query username")?,
                password: get_str(&mut payload, "Query password")?,
            })
        } else {
            None
        };
        Ok(Self {
            version,
            prefix,
            from,
            to,
            credentials,
        })
    }
}

// =============================================================================
// RESPONSE (0x02)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Every record of the range follows
    Full,
    /// Only `(from, redirect_to]` follows
    Redirect { redirect_to: u64 },
    /// Nothing cached inside the range
    Miss,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Full => "full",
            Status::Redirect { .. } => "redirect",
            Status::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    /// Number of records in the RECORDS frames that follow
    pub count: u64,
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let (code, redirect_to) = match self.status {
            Status::Full => (0u8, 0u64),
            Status::Redirect { redirect_to } => (1, redirect_to),
            Status::Miss => (2, 0),
        };
        let mut body = BytesMut::with_capacity(17);
        body.put_u8(code);
        body.put_u64(redirect_to);
        body.put_u64(self.count);
        frame(MessageType::Response, body)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 17 {
            return Err(truncated("Response"));
        }
        let code = payload.get_u8();
        let redirect_to = payload.get_u64();
        let count = payload.get_u64();
        let status = match code {
            0 => Status::Full,
            1 => Status::Redirect { redirect_to },
            2 => Status::Miss,
            other => {
                return Err(SyncError::Protocol(format!("unknown response status {}", other)).into())
            }
        };
        Ok(Self { status, count })
    }
}

// =============================================================================
// RECORDS (0x03)
// =============================================================================

/// A chunk of encoded record lines, newline-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Records {
    pub lines: String,
}

impl Records {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(self.lines.len());
        body.put_slice(self.lines.as_bytes());
        frame(MessageType::Records, body)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let lines = String::from_utf8(payload.to_vec())
            .map_err(|_| SyncError::Protocol("invalid UTF-8 in Records".to_string()))?;
        Ok(Self { lines })
    }
}

// =============================================================================
// DONE (0x04)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub count: u64,
}

impl Done {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(8);
        body.put_u64(self.count);
        frame(MessageType::Done, body)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            return Err(truncated("Done"));
        }
        Ok(Self {
            count: payload.get_u64(),
        })
    }
}

// =============================================================================
// FATAL (0x0E)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    BadRequest = 1,
    Unauthorized = 2,
    Internal = 3,
    UnsupportedVersion = 4,
}

#[derive(Debug, Clone)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as u16,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut message = self.message.as_str();
        if message.len() > u16::MAX as usize {
            let mut cut = u16::MAX as usize;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message = &message[..cut];
        }
        let mut body = BytesMut::with_capacity(4 + message.len());
        body.put_u16(self.code);
        put_str(&mut body, message);
        frame(MessageType::Fatal, body)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            return Err(truncated("Fatal"));
        }
        let code = payload.get_u16();
        let message = get_str(&mut payload, "Fatal message")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        ))
        .into());
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| SyncError::Protocol(format!("unknown message type {:#04x}", msg_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(frame: &Bytes) -> Bytes {
        // Skip frame header (4 bytes len + 1 byte type)
        Bytes::copy_from_slice(&frame[5..])
    }

    #[test]
    fn test_query_with_credentials() {
        let query = Query::new("//depot/proj", 1000, 2000).with_credentials(Some(Credentials {
            username: "builder".to_string(),
            password: "s3cret".to_string(),
        }));
        let encoded = query.encode().unwrap();
        assert_eq!(encoded[4], MessageType::Query as u8);
        assert_eq!(Query::decode(payload(&encoded)).unwrap(), query);
    }

    #[test]
    fn test_redirect_response() {
        let response = Response {
            status: Status::Redirect { redirect_to: 1500 },
            count: 42,
        };
        let decoded = Response::decode(payload(&response.encode())).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_unknown_status_is_protocol_error() {
        let mut body = BytesMut::new();
        body.put_u8(9);
        body.put_u64(0);
        body.put_u64(0);
        let err = Response::decode(body.freeze()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_query() {
        let encoded = Query::new("//depot", 1, 2).encode().unwrap();
        let short = Bytes::copy_from_slice(&encoded[5..encoded.len() - 3]);
        assert!(Query::decode(short).is_err());
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Records { lines: "1,a,1,add,text,0,\n".to_string() }.encode())
            .await
            .unwrap();
        write_frame(&mut wire, &Done { count: 1 }.encode()).await.unwrap();

        let mut reader = wire.as_slice();
        let (t, p) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t, MessageType::Records);
        assert_eq!(Records::decode(p).unwrap().lines, "1,a,1,add,text,0,\n");
        let (t, p) = read_frame(&mut reader).await.unwrap();
        assert_eq!(t, MessageType::Done);
        assert_eq!(Done::decode(p).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        wire.push(MessageType::Records as u8);
        let mut reader = wire.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }
}
