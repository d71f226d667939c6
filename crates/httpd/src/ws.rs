//! WebSocket upgrade handshake and framing.
//!
//! The handshake helpers validate an upgrade request and build the raw
//! `101 Switching Protocols` head the dispatcher writes before bytes start to
//! flow unframed. [`WsCodec`] is a `tokio_util::codec` frame codec, and
//! [`WebSocket`] assembles messages on top of the blocking
//! [`read`](HttpIo::read) / [`write`](HttpIo::write) calls of an upgraded
//! request context.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderMap, StatusCode, header};
use sha1::{Digest, Sha1};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::ensure;
use crate::io::HttpIo;
use crate::protocol::StreamError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest reassembled message accepted from a client.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Whether the headers ask for a WebSocket upgrade: `Connection` lists
/// `upgrade` and `Upgrade` is `websocket`.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .flat_map(|value| value.as_bytes().split(|b| *b == b','))
        .any(|token| token.trim_ascii().eq_ignore_ascii_case(b"upgrade"));

    connection_upgrade
        && headers.get(header::UPGRADE).is_some_and(|value| value.as_bytes().trim_ascii().eq_ignore_ascii_case(b"websocket"))
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    pub status: StatusCode,
    pub reason: &'static str,
}

/// Checks an upgrade request and returns the `Sec-WebSocket-Accept` value.
pub fn validate_upgrade(headers: &HeaderMap) -> Result<String, Reject> {
    ensure!(is_upgrade_request(headers), Reject { status: StatusCode::BAD_REQUEST, reason: "Not a WebSocket upgrade request" });

    let version = headers.get(header::SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes().trim_ascii());
    ensure!(
        version == Some(b"13".as_slice()),
        Reject { status: StatusCode::UPGRADE_REQUIRED, reason: "Unsupported WebSocket version" }
    );

    let key = headers.get(header::SEC_WEBSOCKET_KEY).and_then(|v| v.to_str().ok()).map(str::trim).unwrap_or_default();
    ensure!(!key.is_empty(), Reject { status: StatusCode::BAD_REQUEST, reason: "Missing Sec-WebSocket-Key header" });

    Ok(accept_key(key))
}

/// `Sec-WebSocket-Accept` for a client key: base64 of the SHA-1 of key and GUID.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Raw `101 Switching Protocols` head.
pub fn switching_protocols(accept: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, StreamError> {
        match value & 0x0F {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(StreamError::protocol(format!("unknown websocket opcode 0x{other:X}"))),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new<B: Into<Bytes>>(opcode: Opcode, payload: B) -> Self {
        Self { fin: true, opcode, payload: payload.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// Frame codec. The server side expects masked frames and sends unmasked
/// ones, the client side does the reverse.
#[derive(Debug)]
pub struct WsCodec {
    role: Role,
    max_frame: usize,
}

impl WsCodec {
    pub fn server() -> Self {
        Self { role: Role::Server, max_frame: MAX_MESSAGE_SIZE }
    }

    pub fn client() -> Self {
        Self { role: Role::Client, max_frame: MAX_MESSAGE_SIZE }
    }
}

impl Decoder for WsCodec {
    type Item = Frame;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let (b0, b1) = (src[0], src[1]);
        let fin = b0 & 0x80 != 0;
        ensure!(b0 & 0x70 == 0, StreamError::protocol("reserved websocket bits must be 0"));
        let opcode = Opcode::from_u8(b0)?;

        let masked = b1 & 0x80 != 0;
        match self.role {
            Role::Server => ensure!(masked, StreamError::protocol("client frames must be masked")),
            Role::Client => ensure!(!masked, StreamError::protocol("server frames must not be masked")),
        }

        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            n => (u64::from(n), 2),
        };

        if opcode.is_control() {
            ensure!(fin, StreamError::protocol("control frames must not be fragmented"));
            ensure!(len <= 125, StreamError::protocol("control frame payload exceeds 125 bytes"));
        }
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        ensure!(len <= self.max_frame, StreamError::TooLarge { max: self.max_frame as u64 });

        let mask = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < offset + len {
            src.reserve(offset + len - src.len());
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame { fin, opcode, payload: payload.freeze() }))
    }
}

impl Encoder<Frame> for WsCodec {
    type Error = StreamError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        let mask_bit = if self.role == Role::Client { 0x80 } else { 0 };

        dst.reserve(len + 14);
        dst.put_u8(if frame.fin { 0x80 } else { 0 } | frame.opcode.to_u8());
        match len {
            0..=125 => dst.put_u8(mask_bit | len as u8),
            126..=0xFFFF => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len as u64);
            }
        }

        if self.role == Role::Client {
            let key = fastrand::u32(..).to_be_bytes();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }
        Ok(())
    }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

/// A complete message read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    /// The peer closed the session, the close frame was answered already.
    Close { code: Option<u16>, reason: String },
}

/// Message-level view of an upgraded request context.
///
/// Pings are answered while reading; fragmented messages are reassembled.
#[derive(Debug)]
pub struct WebSocket<'a> {
    io: &'a HttpIo,
    codec: WsCodec,
    buf: BytesMut,
    closed: bool,
}

impl<'a> WebSocket<'a> {
    pub(crate) fn new(io: &'a HttpIo) -> Self {
        Self { io, codec: WsCodec::server(), buf: BytesMut::with_capacity(READ_CHUNK), closed: false }
    }

    /// Blocks for the next message. `None` means the peer went away without a close frame.
    pub fn read_message(&mut self) -> Result<Option<Message>, StreamError> {
        let mut partial: Option<(Opcode, BytesMut)> = None;

        loop {
            let Some(frame) = self.codec.decode(&mut self.buf)? else {
                if !self.fill()? {
                    return Ok(None);
                }
                continue;
            };

            match frame.opcode {
                Opcode::Ping => self.send_frame(Frame::new(Opcode::Pong, frame.payload))?,
                Opcode::Pong => {}
                Opcode::Close => {
                    let (code, reason) = parse_close_payload(&frame.payload)?;
                    debug!(?code, "websocket closed by peer");
                    if !self.closed {
                        self.send_close(code.unwrap_or(1000), "")?;
                    }
                    return Ok(Some(Message::Close { code, reason }));
                }
                Opcode::Continuation => {
                    let Some((_, data)) = partial.as_mut() else {
                        return Err(StreamError::protocol("continuation frame without initial frame"));
                    };
                    ensure!(data.len() + frame.payload.len() <= MAX_MESSAGE_SIZE, StreamError::TooLarge { max: MAX_MESSAGE_SIZE as u64 });
                    data.extend_from_slice(&frame.payload);

                    if frame.fin
                        && let Some((opcode, data)) = partial.take()
                    {
                        return into_message(opcode, data.freeze()).map(Some);
                    }
                }
                opcode @ (Opcode::Text | Opcode::Binary) => {
                    ensure!(partial.is_none(), StreamError::protocol("new data frame inside a fragmented message"));
                    if frame.fin {
                        return into_message(opcode, frame.payload).map(Some);
                    }
                    partial = Some((opcode, BytesMut::from(&frame.payload[..])));
                }
            }
        }
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), StreamError> {
        self.send_frame(Frame::new(Opcode::Text, Bytes::copy_from_slice(text.as_bytes())))
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.send_frame(Frame::new(Opcode::Binary, Bytes::copy_from_slice(data)))
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<(), StreamError> {
        ensure!(payload.len() <= 125, StreamError::protocol("ping payload exceeds 125 bytes"));
        self.send_frame(Frame::new(Opcode::Ping, Bytes::copy_from_slice(payload)))
    }

    /// Sends a close frame and ends the session; the dispatcher closes the
    /// connection once the frame is out.
    pub fn close(mut self, code: u16, reason: &str) -> Result<(), StreamError> {
        if !self.closed {
            self.send_close(code, reason)?;
        }
        Ok(())
    }

    fn send_close(&mut self, code: u16, reason: &str) -> Result<(), StreamError> {
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..end]);

        self.send_frame(Frame::new(Opcode::Close, payload.freeze()))?;
        self.closed = true;
        self.io.write(&[])
    }

    fn send_frame(&mut self, frame: Frame) -> Result<(), StreamError> {
        ensure!(!self.closed, StreamError::protocol("websocket session is closed"));

        let mut out = BytesMut::with_capacity(frame.payload.len() + 14);
        self.codec.encode(frame, &mut out)?;
        self.io.write(&out)
    }

    /// Reads more raw bytes, `false` at the end of the stream.
    fn fill(&mut self) -> Result<bool, StreamError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.io.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n > 0)
    }
}

fn into_message(opcode: Opcode, data: Bytes) -> Result<Message, StreamError> {
    if opcode == Opcode::Text {
        let text = String::from_utf8(data.to_vec()).map_err(|e| StreamError::protocol(format!("invalid utf-8 text message: {e}")))?;
        Ok(Message::Text(text))
    } else {
        Ok(Message::Binary(data))
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<(Option<u16>, String), StreamError> {
    match payload {
        [] => Ok((None, String::new())),
        [_] => Err(StreamError::protocol("close frame payload must be empty or at least 2 bytes")),
        [hi, lo, reason @ ..] => {
            let reason = std::str::from_utf8(reason).map_err(|e| StreamError::protocol(format!("invalid close reason: {e}")))?;
            Ok((Some(u16::from_be_bytes([*hi, *lo])), reason.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn upgrade_headers(version: &'static str, key: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static(version));
        if let Some(key) = key {
            headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static(key));
        }
        headers
    }

    #[test]
    fn accept_key_sample() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn validate_upgrade_rejections() {
        assert_eq!(validate_upgrade(&upgrade_headers("13", Some("dGhlIHNhbXBsZSBub25jZQ=="))).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(validate_upgrade(&upgrade_headers("8", Some("abc"))).unwrap_err().status, StatusCode::UPGRADE_REQUIRED);
        assert_eq!(validate_upgrade(&upgrade_headers("13", None)).unwrap_err().status, StatusCode::BAD_REQUEST);
        assert_eq!(validate_upgrade(&HeaderMap::new()).unwrap_err().status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn client_frame_decoded_by_server() {
        let mut client = WsCodec::client();
        let mut server = WsCodec::server();

        let mut wire = BytesMut::new();
        client.encode(Frame::new(Opcode::Text, "hello"), &mut wire).unwrap();
        assert_ne!(&wire[6..], b"hello");

        let mut partial = wire.split_to(3);
        assert!(server.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);

        let frame = server.decode(&mut partial).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn unmasked_client_frame_is_rejected() {
        let mut server = WsCodec::server();
        let mut wire = BytesMut::from(&[0x81, 0x02, b'h', b'i'][..]);
        assert!(matches!(server.decode(&mut wire), Err(StreamError::Protocol { .. })));
    }

    #[test]
    fn extended_length_frame() {
        let mut server = WsCodec::server();
        let mut client = WsCodec::client();

        let payload = vec![7u8; 70_000];
        let mut wire = BytesMut::new();
        server.encode(Frame::new(Opcode::Binary, payload.clone()), &mut wire).unwrap();
        assert_eq!(wire[1], 127);

        let frame = client.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), payload.len());
    }

    #[test]
    fn close_payload() {
        assert_eq!(parse_close_payload(&[]).unwrap(), (None, String::new()));
        assert_eq!(parse_close_payload(&[0x03, 0xE8, b'b', b'y', b'e']).unwrap(), (Some(1000), "bye".to_owned()));
        assert!(parse_close_payload(&[0x03]).is_err());
    }
}
