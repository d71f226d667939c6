//! Streaming response encoder used with `FramedWrite` or a plain `BytesMut`.
//!
//! A [`Message::Header`] selects the body framing; payload items are then
//! framed accordingly until [`PayloadItem::Eof`] completes the response.
//!
//! Responses to `HEAD` requests announce their real size but carry no body:
//! call [`ResponseEncoder::head_only`] before encoding such a head, body
//! chunks are then dropped.

use std::io::{self, ErrorKind};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadItem, PayloadSize, ResponseHead, SendError};

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
    head_only: bool,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next head is written with its real framing headers, the body is skipped.
    pub fn head_only(&mut self) {
        self.head_only = true;
    }

    /// True while a response head was written but its body is not finished.
    pub fn in_body(&self) -> bool {
        self.payload_encoder.is_some()
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                self.payload_encoder =
                    Some(if std::mem::take(&mut self.head_only) { PayloadEncoder::skip() } else { payload_size.into() });
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    if payload_item.is_eof() {
                        return Ok(());
                    }
                    error!("expect response header but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(payload_item, dst);
                if payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }

                result
            }
        }
    }
}
