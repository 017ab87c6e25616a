//! Per-connection WebSocket framing over a raw byte stream.
//!
//! The codec owns two buffers: the raw inbound buffer that socket reads land
//! in, and a fragment list that accumulates data frames until a FIN. Both the
//! upgrade parse and the frame parse are incremental: a short buffer is left
//! untouched and the caller simply reads more bytes.

use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use thiserror::Error;

use base64::engine::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

const MIN_HEADER_SIZE: usize = 2;
const MAX_CONTROL_PAYLOAD: usize = 125;
const MAX_HANDSHAKE_SIZE: usize = 8 << 10;
const MAX_MESSAGE_SIZE: usize = 64 << 20;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Error)]
pub enum WsError {
    #[error("malformed upgrade request: {0}")]
    BadHandshake(#[from] httparse::Error),
    #[error("upgrade request is not a websocket upgrade")]
    NotAnUpgrade,
    #[error("upgrade request exceeds {MAX_HANDSHAKE_SIZE} bytes")]
    HandshakeTooLarge,
    #[error("reserved frame bits are set")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpCode(u8),
    #[error("client frame is not masked")]
    UnmaskedFrame,
    #[error("control frame spans multiple fragments")]
    FragmentedControlFrame,
    #[error("control frame payload exceeds {MAX_CONTROL_PAYLOAD} bytes")]
    OversizedControlFrame,
    #[error("frame payload exceeds the message size limit")]
    FrameTooLarge,
    #[error("continuation frame without a preceding data frame")]
    StrayContinuation,
    #[error("data frame interleaved into an unfinished fragment sequence")]
    InterleavedDataFrame,
    #[error("close frame carries a malformed payload")]
    BadCloseFrame,
    #[error("text message is not valid utf-8")]
    BadUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    fn from_bits(bits: u8) -> Result<Self, WsError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(WsError::UnknownOpCode(other)),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A complete application message (text or binary). Control frames never
/// surface here.
#[derive(Debug)]
pub struct Message {
    pub opcode: OpCode,
    pub payload: Bytes,
}

/// Result of a successful upgrade: the `101 Switching Protocols` bytes owed
/// to the peer and the query parameters from the request line.
pub struct Handshake {
    pub response: Vec<u8>,
    pub params: HashMap<String, String>,
}

/// Everything one decode pass produced: application messages in wire order,
/// encoded control replies owed to the peer, and whether a close frame ended
/// the stream.
#[derive(Debug, Default)]
pub struct Decoded {
    pub messages: Vec<Message>,
    pub replies: Vec<Vec<u8>>,
    pub close: bool,
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    fin: bool,
    opcode: OpCode,
    mask: [u8; 4],
    payload_len: usize,
}

enum State {
    AwaitingHandshake,
    Streaming,
}

pub struct WsCodec {
    state: State,
    buf: BytesMut,
    // Frame whose header is parsed but whose payload is still short.
    header: Option<FrameHeader>,
    // Unfinished fragment sequence, payloads already unmasked.
    pending: Vec<(OpCode, BytesMut)>,
}

impl WsCodec {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingHandshake,
            buf: BytesMut::with_capacity(8192),
            header: None,
            pending: Vec::new(),
        }
    }

    /// Raw inbound buffer; socket reads append here.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, State::Streaming)
    }

    /// Attempts the opening handshake against the buffered bytes.
    ///
    /// `Ok(None)` means the request is still incomplete and the buffer was
    /// left untouched. On success the consumed bytes are dropped and the
    /// codec transitions to streaming; anything that arrived after the
    /// request stays buffered for [`WsCodec::decode`].
    pub fn upgrade(&mut self) -> Result<Option<Handshake>, WsError> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let consumed = match req.parse(&self.buf[..])? {
            httparse::Status::Partial => {
                if self.buf.len() > MAX_HANDSHAKE_SIZE {
                    return Err(WsError::HandshakeTooLarge);
                }
                return Ok(None);
            }
            httparse::Status::Complete(consumed) => consumed,
        };

        if req.method != Some("GET") {
            return Err(WsError::NotAnUpgrade);
        }
        let mut upgrade_ok = false;
        let mut connection_ok = false;
        let mut version_ok = false;
        let mut key = None;
        for header in req.headers.iter() {
            let Ok(value) = std::str::from_utf8(header.value) else {
                continue;
            };
            if header.name.eq_ignore_ascii_case("upgrade") {
                upgrade_ok = value.to_ascii_lowercase().contains("websocket");
            } else if header.name.eq_ignore_ascii_case("connection") {
                connection_ok = value.to_ascii_lowercase().contains("upgrade");
            } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
                version_ok = value.trim() == "13";
            } else if header.name.eq_ignore_ascii_case("sec-websocket-key") {
                key = Some(value.trim().to_string());
            }
        }
        let Some(key) = key else {
            return Err(WsError::NotAnUpgrade);
        };
        if !upgrade_ok || !connection_ok || !version_ok {
            return Err(WsError::NotAnUpgrade);
        }

        let params = parse_query_params(req.path.unwrap_or(""));
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        )
        .into_bytes();

        self.buf.advance(consumed);
        self.state = State::Streaming;
        Ok(Some(Handshake { response, params }))
    }

    /// Runs the incremental frame loop over the buffered bytes.
    ///
    /// Returns when the buffer is exhausted or holds only a partial frame;
    /// partial input is preserved intact for the next pass.
    pub fn decode(&mut self) -> Result<Decoded, WsError> {
        let mut out = Decoded::default();
        loop {
            let header = match self.header {
                Some(header) => header,
                None => {
                    if self.buf.len() < MIN_HEADER_SIZE {
                        return Ok(out);
                    }
                    let Some((header, consumed)) = parse_header(&self.buf)? else {
                        return Ok(out);
                    };
                    self.buf.advance(consumed);
                    self.header = Some(header);
                    header
                }
            };

            if self.buf.len() < header.payload_len {
                return Ok(out);
            }
            let mut payload = self.buf.split_to(header.payload_len);
            unmask(&mut payload, header.mask);
            self.header = None;

            if header.opcode.is_control() {
                self.handle_control(header.opcode, &payload, &mut out)?;
                if out.close {
                    return Ok(out);
                }
                continue;
            }

            match header.opcode {
                OpCode::Continuation if self.pending.is_empty() => {
                    return Err(WsError::StrayContinuation);
                }
                OpCode::Text | OpCode::Binary if !self.pending.is_empty() => {
                    return Err(WsError::InterleavedDataFrame);
                }
                _ => {}
            }

            if header.fin && self.pending.is_empty() {
                out.messages
                    .push(assemble(header.opcode, payload.freeze())?);
            } else {
                self.pending.push((header.opcode, payload));
                if header.fin {
                    let opcode = self.pending[0].0;
                    let mut assembled = BytesMut::new();
                    for (_, chunk) in self.pending.drain(..) {
                        assembled.extend_from_slice(&chunk);
                    }
                    out.messages.push(assemble(opcode, assembled.freeze())?);
                }
            }
        }
    }

    fn handle_control(
        &self,
        opcode: OpCode,
        payload: &[u8],
        out: &mut Decoded,
    ) -> Result<(), WsError> {
        match opcode {
            OpCode::Ping => out.replies.push(encode_frame(OpCode::Pong, payload)),
            OpCode::Pong => {}
            OpCode::Close => {
                match payload.len() {
                    0 => {}
                    1 => return Err(WsError::BadCloseFrame),
                    _ => {
                        if std::str::from_utf8(&payload[2..]).is_err() {
                            return Err(WsError::BadCloseFrame);
                        }
                    }
                }
                out.replies.push(encode_frame(OpCode::Close, payload));
                out.close = true;
            }
            _ => {}
        }
        Ok(())
    }
}

fn assemble(opcode: OpCode, payload: Bytes) -> Result<Message, WsError> {
    if opcode == OpCode::Text && std::str::from_utf8(&payload).is_err() {
        return Err(WsError::BadUtf8);
    }
    Ok(Message { opcode, payload })
}

/// Parses one client frame header without consuming.
///
/// `Ok(None)` means the buffer ends inside the header; nothing is committed
/// until the whole header is present.
fn parse_header(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>, WsError> {
    if buf[0] & 0x70 != 0 {
        return Err(WsError::ReservedBits);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = OpCode::from_bits(buf[0] & 0x0F)?;
    // Client frames are always masked; anything else is hostile framing.
    if buf[1] & 0x80 == 0 {
        return Err(WsError::UnmaskedFrame);
    }

    let length_code = buf[1] & 0x7F;
    let extra = match length_code {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let header_len = 2 + extra + 4;
    if buf.len() < header_len {
        return Ok(None);
    }

    let payload_len = match extra {
        0 => length_code as usize,
        2 => u16::from_be_bytes([buf[2], buf[3]]) as usize,
        _ => {
            let mut be = [0u8; 8];
            be.copy_from_slice(&buf[2..10]);
            u64::from_be_bytes(be) as usize
        }
    };
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(WsError::FrameTooLarge);
    }
    if opcode.is_control() {
        if !fin {
            return Err(WsError::FragmentedControlFrame);
        }
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WsError::OversizedControlFrame);
        }
    }

    let mask_at = 2 + extra;
    let mask = [
        buf[mask_at],
        buf[mask_at + 1],
        buf[mask_at + 2],
        buf[mask_at + 3],
    ];
    Ok(Some((
        FrameHeader {
            fin,
            opcode,
            mask,
            payload_len,
        },
        header_len,
    )))
}

fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encodes an unmasked server frame with the minimal header for the length.
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(10 + payload.len());
    frame.push(0x80 | opcode as u8);
    if payload.len() > u16::MAX as usize {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    } else if payload.len() > 125 {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(payload.len() as u8);
    }
    frame.extend_from_slice(payload);
    frame
}

fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

// Query parameters from the request line. Names run to the `=`; values are
// the longest run of `[0-9A-Za-z-]`, anything after is ignored.
fn parse_query_params(path: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some((_, query)) = path.split_once('?') else {
        return params;
    };
    for pair in query.split('&') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let value: String = value
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        params.insert(name.to_string(), value);
    }
    params
}
