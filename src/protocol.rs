//! Memcached binary protocol framing
//!
//! ## Wire Format
//!
//! Requests and responses share the 24-byte binary header:
//!
//! ```text
//! ┌───────────┬───────────┬────────────────┬────────────────┐
//! │ magic (1) │ opcode(1) │  key len (2)   │ extras len (1) │
//! ├───────────┼───────────┴────────────────┴────────────────┤
//! │ dtype (1) │ vbucket id / status (2)                     │
//! ├───────────┴─────────────────────────────────────────────┤
//! │ total body len (4) = extras + key + value               │
//! │ opaque (4)                                              │
//! │ cas (8)                                                 │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! followed by extras, key, value.

use crate::{Result, StoreError};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const REQ_MAGIC: u8 = 0x80;
pub const RES_MAGIC: u8 = 0x81;
pub const HEADER_LEN: usize = 24;

/// Largest accepted total body (extras + key + value)
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Delete = 0x04,
    Flush = 0x08,
    Noop = 0x0a,
    TapConnect = 0x40,
    TapMutation = 0x41,
    TapDelete = 0x42,
    TapOpaque = 0x44,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Opcode> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x04 => Some(Opcode::Delete),
            0x08 => Some(Opcode::Flush),
            0x0a => Some(Opcode::Noop),
            0x40 => Some(Opcode::TapConnect),
            0x41 => Some(Opcode::TapMutation),
            0x42 => Some(Opcode::TapDelete),
            0x44 => Some(Opcode::TapOpaque),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    KeyNotFound = 0x0001,
    TooBig = 0x0003,
    Einval = 0x0004,
    NotMyVbucket = 0x0007,
    UnknownCommand = 0x0081,
    InternalError = 0x0084,
}

impl Status {
    pub fn from_u16(value: u16) -> Option<Status> {
        match value {
            0x0000 => Some(Status::Success),
            0x0001 => Some(Status::KeyNotFound),
            0x0003 => Some(Status::TooBig),
            0x0004 => Some(Status::Einval),
            0x0007 => Some(Status::NotMyVbucket),
            0x0081 => Some(Status::UnknownCommand),
            0x0084 => Some(Status::InternalError),
            _ => None,
        }
    }
}

/// A parsed request frame. The opcode stays raw so unknown commands can be
/// answered instead of dropped at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(opcode: Opcode) -> Request {
        Request {
            opcode: opcode as u8,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = self.extras.len() + self.key.len() + self.body.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8(REQ_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0);
        buf.put_u16(self.vbucket);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.body);
        buf.to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub body: Vec<u8>,

    /// Not on the wire: the connection is beyond saving and must close
    /// after this response.
    pub fatal: bool,
}

impl Response {
    pub fn new(opcode: u8, status: Status) -> Response {
        Response {
            opcode,
            status,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            body: Vec::new(),
            fatal: false,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = self.extras.len() + self.key.len() + self.body.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u8(RES_MAGIC);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0);
        buf.put_u16(self.status as u16);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.body);
        buf.to_vec()
    }
}

struct Frame {
    opcode: u8,
    field: u16,
    opaque: u32,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    body: Vec<u8>,
}

/// Read one frame with the given magic. Ok(None) on clean EOF before any
/// header byte.
async fn read_frame<R>(r: &mut R, magic: u8) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = r.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(StoreError::Protocol("truncated frame header".to_string()));
        }
        filled += n;
    }

    let mut buf = &header[..];
    let got_magic = buf.get_u8();
    if got_magic != magic {
        return Err(StoreError::Protocol(format!(
            "bad magic: {:#04x}",
            got_magic
        )));
    }
    let opcode = buf.get_u8();
    let key_len = buf.get_u16() as usize;
    let extras_len = buf.get_u8() as usize;
    let _data_type = buf.get_u8();
    let field = buf.get_u16();
    let body_len = buf.get_u32();
    let opaque = buf.get_u32();
    let cas = buf.get_u64();

    if body_len > MAX_BODY_LEN {
        return Err(StoreError::Protocol(format!("body too large: {}", body_len)));
    }
    let body_len = body_len as usize;
    if body_len < key_len + extras_len {
        return Err(StoreError::Protocol(
            "body length smaller than key and extras".to_string(),
        ));
    }

    let mut payload = vec![0u8; body_len];
    r.read_exact(&mut payload).await?;
    let extras = payload[..extras_len].to_vec();
    let key = payload[extras_len..extras_len + key_len].to_vec();
    let body = payload[extras_len + key_len..].to_vec();

    Ok(Some(Frame {
        opcode,
        field,
        opaque,
        cas,
        extras,
        key,
        body,
    }))
}

pub async fn read_request<R>(r: &mut R) -> Result<Option<Request>>
where
    R: AsyncRead + Unpin,
{
    Ok(read_frame(r, REQ_MAGIC).await?.map(|f| Request {
        opcode: f.opcode,
        vbucket: f.field,
        opaque: f.opaque,
        cas: f.cas,
        extras: f.extras,
        key: f.key,
        body: f.body,
    }))
}

pub async fn read_response<R>(r: &mut R) -> Result<Option<Response>>
where
    R: AsyncRead + Unpin,
{
    let Some(f) = read_frame(r, RES_MAGIC).await? else {
        return Ok(None);
    };
    let status = Status::from_u16(f.field)
        .ok_or_else(|| StoreError::Protocol(format!("unknown status: {:#06x}", f.field)))?;
    Ok(Some(Response {
        opcode: f.opcode,
        status,
        opaque: f.opaque,
        cas: f.cas,
        extras: f.extras,
        key: f.key,
        body: f.body,
        fatal: false,
    }))
}

pub async fn write_request<W>(w: &mut W, req: &Request) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&req.to_bytes()).await?;
    Ok(())
}

pub async fn write_response<W>(w: &mut W, res: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&res.to_bytes()).await?;
    Ok(())
}
