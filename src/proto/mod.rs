//! Pack store wire protocol
//!
//! Every message is one frame:
//! [1 byte: type] [4 bytes LE: body length] [body...]
//!
//! Integers in bodies are little-endian. Strings carry a 2-byte length
//! prefix, byte blobs a 4-byte one. Requests use types 0x01..0x0f, replies
//! 0x81..0x8f, and 0xff is an error reply.

use crate::meta::{MetaError, RootRecord};
use crate::remote::RemoteError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Version string exchanged on attach
pub const PROTOCOL_VERSION: &str = "packstore1";

/// Frame size limit used until attach negotiates one
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Smallest frame size limit either side accepts
pub const MIN_MESSAGE_SIZE: usize = 4096;

/// Type byte plus body length
pub const FRAME_HEADER: usize = 5;

/// Frame bytes in a read-at reply that are not file data
pub const READ_OVERHEAD: usize = FRAME_HEADER + 4;

/// Frame bytes in a write-pack request that are not pack data
pub const WRITE_OVERHEAD: usize = FRAME_HEADER + 4 + 4;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("message of {0} bytes exceeds limit of {1}")]
    TooLarge(usize, usize),

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtoError {
    /// The peer closed the connection between frames
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtoError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Result type for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Error classes carried in an error reply, so typed conflicts survive the
/// trip to the client
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Other = 0x00,
    BadRequest = 0x01,
    WrongKey = 0x02,
    NotFound = 0x03,
    DuplicatePack = 0x04,
    GcOccurred = 0x05,
    GcNotRunning = 0x06,
    GcInProgress = 0x07,
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ErrorCode::BadRequest,
            0x02 => ErrorCode::WrongKey,
            0x03 => ErrorCode::NotFound,
            0x04 => ErrorCode::DuplicatePack,
            0x05 => ErrorCode::GcOccurred,
            0x06 => ErrorCode::GcNotRunning,
            0x07 => ErrorCode::GcInProgress,
            _ => ErrorCode::Other,
        }
    }
}

impl ErrorCode {
    /// Classify a server-side error
    pub fn of(err: &RemoteError) -> Self {
        match err {
            RemoteError::BadRequest(_) => ErrorCode::BadRequest,
            RemoteError::WrongKey => ErrorCode::WrongKey,
            RemoteError::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorCode::NotFound,
            RemoteError::Meta(MetaError::DuplicatePack(_)) => ErrorCode::DuplicatePack,
            RemoteError::Meta(MetaError::InvalidPackName(_)) => ErrorCode::BadRequest,
            RemoteError::Meta(MetaError::GcOccurred) => ErrorCode::GcOccurred,
            RemoteError::Meta(MetaError::GcNotRunning) => ErrorCode::GcNotRunning,
            RemoteError::Meta(MetaError::GcInProgress) => ErrorCode::GcInProgress,
            _ => ErrorCode::Other,
        }
    }

    /// Rebuild a client-side error from an error reply
    pub fn into_error(self, message: String) -> RemoteError {
        match self {
            ErrorCode::Other => RemoteError::Server(message),
            ErrorCode::BadRequest => RemoteError::BadRequest(message),
            ErrorCode::WrongKey => RemoteError::WrongKey,
            ErrorCode::NotFound => RemoteError::Io(io::Error::new(io::ErrorKind::NotFound, message)),
            ErrorCode::DuplicatePack => RemoteError::Meta(MetaError::DuplicatePack(message)),
            ErrorCode::GcOccurred => RemoteError::Meta(MetaError::GcOccurred),
            ErrorCode::GcNotRunning => RemoteError::Meta(MetaError::GcNotRunning),
            ErrorCode::GcInProgress => RemoteError::Meta(MetaError::GcInProgress),
        }
    }
}

/// Client requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Attach { version: String, key_id: String, max_message_size: u32 },
    Open { fid: u32, path: String },
    ReadAt { fid: u32, offset: u64, size: u32 },
    Close { fid: u32 },
    NewPack { pid: u32, path: String },
    /// No reply on success; failures arrive as `Response::PackError`
    WritePack { pid: u32, data: Vec<u8> },
    ClosePack { pid: u32 },
    CancelPack { pid: u32 },
    GetRoot,
    CasRoot { value: String, version: u64, signature: String, epoch: u64 },
    GetEpoch,
    GetGeneration,
    StartGc,
    StopGc,
    Remove { path: String, gc_id: u64 },
}

/// Server replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Attach { version: String, max_message_size: u32 },
    Open,
    ReadAt { data: Vec<u8> },
    Close,
    NewPack,
    PackError { pid: u32, message: String },
    ClosePack,
    CancelPack,
    Root { value: String, version: u64, signature: String },
    CasRoot { ok: bool },
    Epoch { epoch: u64 },
    Generation { generation: u64 },
    StartGc { epoch: u64 },
    StopGc,
    Remove { existed: bool },
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Error reply for a failed request
    pub fn error(err: &RemoteError) -> Self {
        Response::Error {
            code: ErrorCode::of(err),
            message: err.to_string(),
        }
    }

    pub fn root(record: RootRecord) -> Self {
        Response::Root {
            value: record.value,
            version: record.version,
            signature: record.signature,
        }
    }
}

impl Request {
    fn encode(&self) -> ProtoResult<(u8, Vec<u8>)> {
        let mut body = Vec::new();
        let kind = match self {
            Request::Attach { version, key_id, max_message_size } => {
                put_str(&mut body, version)?;
                put_str(&mut body, key_id)?;
                body.write_u32::<LittleEndian>(*max_message_size)?;
                0x01
            }
            Request::Open { fid, path } => {
                body.write_u32::<LittleEndian>(*fid)?;
                put_str(&mut body, path)?;
                0x02
            }
            Request::ReadAt { fid, offset, size } => {
                body.write_u32::<LittleEndian>(*fid)?;
                body.write_u64::<LittleEndian>(*offset)?;
                body.write_u32::<LittleEndian>(*size)?;
                0x03
            }
            Request::Close { fid } => {
                body.write_u32::<LittleEndian>(*fid)?;
                0x04
            }
            Request::NewPack { pid, path } => {
                body.write_u32::<LittleEndian>(*pid)?;
                put_str(&mut body, path)?;
                0x05
            }
            Request::WritePack { pid, data } => {
                body.write_u32::<LittleEndian>(*pid)?;
                put_bytes(&mut body, data)?;
                0x06
            }
            Request::ClosePack { pid } => {
                body.write_u32::<LittleEndian>(*pid)?;
                0x07
            }
            Request::CancelPack { pid } => {
                body.write_u32::<LittleEndian>(*pid)?;
                0x08
            }
            Request::GetRoot => 0x09,
            Request::CasRoot { value, version, signature, epoch } => {
                put_str(&mut body, value)?;
                body.write_u64::<LittleEndian>(*version)?;
                put_str(&mut body, signature)?;
                body.write_u64::<LittleEndian>(*epoch)?;
                0x0a
            }
            Request::GetEpoch => 0x0b,
            Request::GetGeneration => 0x0c,
            Request::StartGc => 0x0d,
            Request::StopGc => 0x0e,
            Request::Remove { path, gc_id } => {
                put_str(&mut body, path)?;
                body.write_u64::<LittleEndian>(*gc_id)?;
                0x0f
            }
        };
        Ok((kind, body))
    }

    fn decode(kind: u8, body: &[u8]) -> ProtoResult<Self> {
        let mut b = Body::new(body);
        let req = match kind {
            0x01 => Request::Attach {
                version: b.string()?,
                key_id: b.string()?,
                max_message_size: b.u32()?,
            },
            0x02 => Request::Open { fid: b.u32()?, path: b.string()? },
            0x03 => Request::ReadAt {
                fid: b.u32()?,
                offset: b.u64()?,
                size: b.u32()?,
            },
            0x04 => Request::Close { fid: b.u32()? },
            0x05 => Request::NewPack { pid: b.u32()?, path: b.string()? },
            0x06 => Request::WritePack { pid: b.u32()?, data: b.bytes()? },
            0x07 => Request::ClosePack { pid: b.u32()? },
            0x08 => Request::CancelPack { pid: b.u32()? },
            0x09 => Request::GetRoot,
            0x0a => Request::CasRoot {
                value: b.string()?,
                version: b.u64()?,
                signature: b.string()?,
                epoch: b.u64()?,
            },
            0x0b => Request::GetEpoch,
            0x0c => Request::GetGeneration,
            0x0d => Request::StartGc,
            0x0e => Request::StopGc,
            0x0f => Request::Remove { path: b.string()?, gc_id: b.u64()? },
            other => return Err(ProtoError::UnknownType(other)),
        };
        b.finish()?;
        Ok(req)
    }
}

impl Response {
    fn encode(&self) -> ProtoResult<(u8, Vec<u8>)> {
        let mut body = Vec::new();
        let kind = match self {
            Response::Attach { version, max_message_size } => {
                put_str(&mut body, version)?;
                body.write_u32::<LittleEndian>(*max_message_size)?;
                0x81
            }
            Response::Open => 0x82,
            Response::ReadAt { data } => {
                put_bytes(&mut body, data)?;
                0x83
            }
            Response::Close => 0x84,
            Response::NewPack => 0x85,
            Response::PackError { pid, message } => {
                body.write_u32::<LittleEndian>(*pid)?;
                put_str(&mut body, message)?;
                0x86
            }
            Response::ClosePack => 0x87,
            Response::CancelPack => 0x88,
            Response::Root { value, version, signature } => {
                put_str(&mut body, value)?;
                body.write_u64::<LittleEndian>(*version)?;
                put_str(&mut body, signature)?;
                0x89
            }
            Response::CasRoot { ok } => {
                body.write_u8(*ok as u8)?;
                0x8a
            }
            Response::Epoch { epoch } => {
                body.write_u64::<LittleEndian>(*epoch)?;
                0x8b
            }
            Response::Generation { generation } => {
                body.write_u64::<LittleEndian>(*generation)?;
                0x8c
            }
            Response::StartGc { epoch } => {
                body.write_u64::<LittleEndian>(*epoch)?;
                0x8d
            }
            Response::StopGc => 0x8e,
            Response::Remove { existed } => {
                body.write_u8(*existed as u8)?;
                0x8f
            }
            Response::Error { code, message } => {
                body.write_u8(*code as u8)?;
                put_str(&mut body, message)?;
                0xff
            }
        };
        Ok((kind, body))
    }

    fn decode(kind: u8, body: &[u8]) -> ProtoResult<Self> {
        let mut b = Body::new(body);
        let resp = match kind {
            0x81 => Response::Attach {
                version: b.string()?,
                max_message_size: b.u32()?,
            },
            0x82 => Response::Open,
            0x83 => Response::ReadAt { data: b.bytes()? },
            0x84 => Response::Close,
            0x85 => Response::NewPack,
            0x86 => Response::PackError { pid: b.u32()?, message: b.string()? },
            0x87 => Response::ClosePack,
            0x88 => Response::CancelPack,
            0x89 => Response::Root {
                value: b.string()?,
                version: b.u64()?,
                signature: b.string()?,
            },
            0x8a => Response::CasRoot { ok: b.flag()? },
            0x8b => Response::Epoch { epoch: b.u64()? },
            0x8c => Response::Generation { generation: b.u64()? },
            0x8d => Response::StartGc { epoch: b.u64()? },
            0x8e => Response::StopGc,
            0x8f => Response::Remove { existed: b.flag()? },
            0xff => Response::Error {
                code: ErrorCode::from(b.u8()?),
                message: b.string()?,
            },
            other => return Err(ProtoError::UnknownType(other)),
        };
        b.finish()?;
        Ok(resp)
    }
}

/// Read one raw frame, refusing frames larger than `max` bytes
pub fn read_frame<R: Read>(reader: &mut R, max: usize) -> ProtoResult<(u8, Vec<u8>)> {
    let kind = reader.read_u8()?;
    let length = reader.read_u32::<LittleEndian>()? as usize;
    if length.saturating_add(FRAME_HEADER) > max {
        return Err(ProtoError::TooLarge(length.saturating_add(FRAME_HEADER), max));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    Ok((kind, body))
}

/// Write one raw frame and flush
pub fn write_frame<W: Write>(writer: &mut W, kind: u8, body: &[u8]) -> ProtoResult<()> {
    let length = u32::try_from(body.len())
        .map_err(|_| ProtoError::TooLarge(body.len(), u32::MAX as usize))?;
    writer.write_u8(kind)?;
    writer.write_u32::<LittleEndian>(length)?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_request<R: Read>(reader: &mut R, max: usize) -> ProtoResult<Request> {
    let (kind, body) = read_frame(reader, max)?;
    Request::decode(kind, &body)
}

pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> ProtoResult<()> {
    let (kind, body) = request.encode()?;
    write_frame(writer, kind, &body)
}

pub fn read_response<R: Read>(reader: &mut R, max: usize) -> ProtoResult<Response> {
    let (kind, body) = read_frame(reader, max)?;
    Response::decode(kind, &body)
}

pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> ProtoResult<()> {
    let (kind, body) = response.encode()?;
    write_frame(writer, kind, &body)
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> ProtoResult<()> {
    let length = u16::try_from(s.len())
        .map_err(|_| ProtoError::TooLarge(s.len(), u16::MAX as usize))?;
    buf.write_u16::<LittleEndian>(length)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) -> ProtoResult<()> {
    let length = u32::try_from(data.len())
        .map_err(|_| ProtoError::TooLarge(data.len(), u32::MAX as usize))?;
    buf.write_u32::<LittleEndian>(length)?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Cursor over a frame body
struct Body<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ProtoResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ProtoError::Malformed("truncated body".to_string()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> ProtoResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn flag(&mut self) -> ProtoResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtoError::Malformed(format!("bad flag byte {}", other))),
        }
    }

    fn u32(&mut self) -> ProtoResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> ProtoResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn string(&mut self) -> ProtoResult<String> {
        let length = LittleEndian::read_u16(self.take(2)?) as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtoError::Malformed("string is not utf-8".to_string()))
    }

    fn bytes(&mut self) -> ProtoResult<Vec<u8>> {
        let length = self.u32()? as usize;
        Ok(self.take(length)?.to_vec())
    }

    fn finish(self) -> ProtoResult<()> {
        if self.pos != self.data.len() {
            return Err(ProtoError::Malformed(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}
