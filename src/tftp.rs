// Packet model and wire codec.
//
// Two framings share one packet model. The datagram framing is RFC 1350: a packet is exactly one
// UDP payload, so the Data payload runs to the end of the buffer. The stream framing is used over
// TCP, where there are no packet boundaries: Data and Error carry a 32-bit length field ahead of
// their payload, everything else is laid out as in the datagram framing.
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
//
// RRQ/WRQ:  opcode | filename | 0x00 | mode | 0x00
// DATA:     opcode | block (2) | [len (4), stream only] | payload
// ACK:      opcode | block (2)
// ERROR:    opcode | code (2) | message | 0x00               (datagram)
//           opcode | code (2) | len (4) | message            (stream)

use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Payload carried by every Data packet except the last one of a transfer.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// The only transfer mode the server accepts (compared case-insensitively).
pub const MODE_OCTET: &str = "octet";

/// Upper bound on a length field or request size in the stream framing.
pub const MAX_FRAME_PAYLOAD: usize = 65_535;

/// Size of the buffer used to receive one datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Everything that can end (or interrupt) a transfer.
#[derive(Debug)]
pub enum TransferError {
    /// The socket, the stream or the local file failed.
    Io(io::Error),

    /// A packet could not be decoded.
    MalformedPacket(String),

    /// The peer sent something that makes no sense at this point of the exchange.
    ProtocolViolation(String),

    /// A single receive timed out. The engine turns this into a retransmission.
    RecvTimeout,

    /// The retry budget for a block was exhausted.
    TransferTimeout { block: u16, attempts: u32 },

    /// The peer sent an Error packet.
    PeerError { code: ErrorCode, message: String },

    /// A datagram arrived from an endpoint other than the session's peer.
    UnknownPeer(SocketAddr),

    /// The stream peer closed the connection between two frames.
    Disconnected,

    /// The transfer was stopped from our side.
    Cancelled,
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Io(e) => write!(f, "I/O error: {e}"),
            TransferError::MalformedPacket(msg) => write!(f, "Malformed packet: {msg}"),
            TransferError::ProtocolViolation(msg) => write!(f, "Protocol violation: {msg}"),
            TransferError::RecvTimeout => write!(f, "Timed out waiting for a packet"),
            TransferError::TransferTimeout { block, attempts } => write!(
                f,
                "Transfer timed out on block {block} after {attempts} attempts"
            ),
            TransferError::PeerError { code, message } => {
                write!(f, "Peer reported error {code}: '{message}'")
            }
            TransferError::UnknownPeer(src) => write!(f, "Packet from unknown peer {src}"),
            TransferError::Disconnected => write!(f, "Peer closed the connection"),
            TransferError::Cancelled => write!(f, "Transfer cancelled"),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(e)
    }
}

pub type TftpResult<T> = Result<T, TransferError>;

fn malformed(msg: impl Into<String>) -> TransferError {
    TransferError::MalformedPacket(msg.into())
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransactionId,
    FileExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransactionId => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// Codes outside the RFC 1350 table are reported as `Undefined`.
    pub fn from_code(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransactionId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined.",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTransactionId => "Unknown transfer ID.",
            ErrorCode::FileExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:?})", self.code(), self)
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            io::ErrorKind::WriteZero | io::ErrorKind::OutOfMemory => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Which way the file travels, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The client reads a file from the server.
    Read,
    /// The client writes a file to the server.
    Write,
}

/// A read or write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub direction: Direction,
    pub filename: String,
    pub mode: String,
}

impl Request {
    /// Builds a request, refusing fields that cannot be put on the wire.
    pub fn new(direction: Direction, filename: &str, mode: &str) -> TftpResult<Request> {
        check_field("filename", filename.as_bytes())?;
        check_field("mode", mode.as_bytes())?;
        Ok(Request {
            direction,
            filename: filename.to_string(),
            mode: mode.to_string(),
        })
    }

    pub fn is_octet(&self) -> bool {
        self.mode.eq_ignore_ascii_case(MODE_OCTET)
    }
}

fn check_field(name: &str, raw: &[u8]) -> TftpResult<()> {
    if raw.is_empty() {
        return Err(malformed(format!("Request {name} is empty")));
    }
    if raw.contains(&0) || !raw.is_ascii() {
        return Err(malformed(format!("Request {name} must be null-free ASCII")));
    }
    Ok(())
}

/// Utility enum naming the TFTP opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    fn code(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read or write request
    Request(Request),

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn u32_from_buffer(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Splits off the bytes in front of the first 0 byte. Returns them with the position of the 0 byte,
/// or `None` when the buffer holds no terminator.
fn cstr_from_buffer(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.iter().position(|&b| b == 0)?;
    Some((&buf[..end], end))
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(malformed(format!("Unknown opcode: {rawcode}"))),
    }
}

/// Parses `filename 0x00 mode 0x00` from the body of a request. Returns the request and the number
/// of body bytes it occupied; anything after the mode terminator (RFC 2347 options) is ignored.
fn parse_request_body(direction: Direction, body: &[u8]) -> TftpResult<(Request, usize)> {
    let (path, path_end) = cstr_from_buffer(body)
        .ok_or_else(|| malformed("Request filename is not terminated"))?;
    let (mode, mode_end) = cstr_from_buffer(&body[path_end + 1..])
        .ok_or_else(|| malformed("Request mode is not terminated"))?;

    check_field("filename", path)?;
    check_field("mode", mode)?;

    let request = Request {
        direction,
        filename: String::from_utf8_lossy(path).into_owned(),
        mode: String::from_utf8_lossy(mode).into_owned(),
    };
    Ok((request, path_end + 1 + mode_end + 1))
}

fn direction_of(op: OpCode) -> Direction {
    if op == OpCode::Rrq {
        Direction::Read
    } else {
        Direction::Write
    }
}

fn put_request(bytes: &mut Vec<u8>, request: &Request) {
    bytes.extend_from_slice(request.filename.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(request.mode.as_bytes());
    bytes.push(0);
}

/// The part of an error message that survives encoding: up to the first 0 byte, cut to at most
/// `limit` bytes on a character boundary.
fn error_text(message: &str, limit: usize) -> &str {
    let text = message.split('\0').next().unwrap_or_default();
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl Packet {
    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::Request(Request { direction: Direction::Read, .. }) => OpCode::Rrq,
            Packet::Request(Request { direction: Direction::Write, .. }) => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// An Error packet carrying the code's stock message.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.default_message().to_string() }
    }

    /// Encodes the packet as a single datagram.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        bytes.extend_from_slice(&self.opcode().code().to_be_bytes());
        match self {
            Packet::Request(request) => put_request(&mut bytes, request),
            Packet::Data { block, data } => {
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            Packet::Ack { block } => bytes.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                bytes.extend_from_slice(&code.code().to_be_bytes());
                bytes.extend_from_slice(error_text(message, MAX_DATAGRAM_SIZE - 5).as_bytes());
                bytes.push(0);
            }
        }
        bytes
    }

    /// Decodes a packet from a complete datagram.
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(malformed("Packet too short to hold an opcode"));
        }

        match retrieve_op_code(buf)? {
            op @ (OpCode::Rrq | OpCode::Wrq) => {
                let (request, _) = parse_request_body(direction_of(op), &buf[2..])?;
                Ok(Packet::Request(request))
            }
            OpCode::Data => {
                if buf.len() < 4 {
                    return Err(malformed("Data packet is missing its block number"));
                }
                Ok(Packet::Data { block: u16_from_buffer(&buf[2..4]), data: buf[4..].to_vec() })
            }
            OpCode::Ack => {
                if buf.len() < 4 {
                    return Err(malformed("Ack packet is missing its block number"));
                }
                Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) })
            }
            OpCode::Error => {
                if buf.len() < 4 {
                    return Err(malformed("Error packet is missing its error code"));
                }
                let code = ErrorCode::from_code(u16_from_buffer(&buf[2..4]));
                // Some peers forget the terminator, take whatever is there.
                let body = &buf[4..];
                let text = cstr_from_buffer(body).map_or(body, |(s, _)| s);
                Ok(Packet::Error { code, message: String::from_utf8_lossy(text).into_owned() })
            }
        }
    }

    /// Encodes the packet as one frame of the stream framing.
    pub fn to_stream_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&self.opcode().code().to_be_bytes());
        match self {
            Packet::Request(request) => put_request(&mut bytes, request),
            Packet::Data { block, data } => {
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
                bytes.extend_from_slice(data);
            }
            Packet::Ack { block } => bytes.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                let text = error_text(message, MAX_FRAME_PAYLOAD);
                bytes.extend_from_slice(&code.code().to_be_bytes());
                bytes.extend_from_slice(&(text.len() as u32).to_be_bytes());
                bytes.extend_from_slice(text.as_bytes());
            }
        }
        bytes
    }

    /// Tries to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds only part of a frame, and the packet together
    /// with the number of bytes it consumed once a whole frame is available.
    pub fn parse_stream_frame(buf: &[u8]) -> TftpResult<Option<(Packet, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        match retrieve_op_code(buf)? {
            op @ (OpCode::Rrq | OpCode::Wrq) => {
                let body = &buf[2..];
                let terminators = body.iter().filter(|&&b| b == 0).take(2).count();
                if terminators < 2 {
                    if body.len() > MAX_FRAME_PAYLOAD {
                        return Err(malformed("Request exceeds the maximum frame size"));
                    }
                    return Ok(None);
                }
                let (request, used) = parse_request_body(direction_of(op), body)?;
                Ok(Some((Packet::Request(request), 2 + used)))
            }
            OpCode::Ack => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                Ok(Some((Packet::Ack { block: u16_from_buffer(&buf[2..4]) }, 4)))
            }
            op @ (OpCode::Data | OpCode::Error) => {
                if buf.len() < 8 {
                    return Ok(None);
                }
                let len = u32_from_buffer(&buf[4..8]) as usize;
                if len > MAX_FRAME_PAYLOAD {
                    return Err(malformed(format!("Frame length {len} exceeds the maximum")));
                }
                if buf.len() < 8 + len {
                    return Ok(None);
                }
                let field = u16_from_buffer(&buf[2..4]);
                let payload = &buf[8..8 + len];
                let packet = if op == OpCode::Data {
                    Packet::Data { block: field, data: payload.to_vec() }
                } else {
                    Packet::Error {
                        code: ErrorCode::from_code(field),
                        message: String::from_utf8_lossy(payload).into_owned(),
                    }
                };
                Ok(Some((packet, 8 + len)))
            }
        }
    }
}
