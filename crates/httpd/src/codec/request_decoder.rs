//! Streaming request decoder used with `FramedRead`.
//!
//! Alternates between the head state ([`HeaderDecoder`]) and the body state
//! ([`PayloadDecoder`]): a head yields [`Message::Header`], then body chunks
//! are yielded as [`Message::Payload`] until [`PayloadItem::Eof`], after which
//! the next pipelined request head is decoded.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::config::HttpConfig;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

#[derive(Debug)]
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new(config: &HttpConfig) -> Self {
        Self { header_decoder: HeaderDecoder::new(config), payload_decoder: None }
    }

    /// True while the body of the last decoded head has not reached its end.
    pub fn in_body(&self) -> bool {
        self.payload_decoder.is_some()
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new(&HttpConfig::default())
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };

            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                self.payload_decoder = Some(payload_size.into());
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}
