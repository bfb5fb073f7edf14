// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::codec::{decode_option, insert_option, DecodedOption};
use super::msg_code::MsgCode;
use super::msg_type::MsgType;
use super::token::MsgToken;
use super::{COAP_MSG_TKL_MASK, COAP_MSG_T_MASK, COAP_MSG_T_OFFS};
use crate::content_format::ContentFormat;
use crate::error::Error;
use crate::option::{OptionIterator, OptionIteratorExt, OptionKey, OptionNumber};
use crate::util::try_decode_u16;
use crate::block::BlockInfo;

/// A zero-copy view of a decoded CoAP message. Borrows from the datagram
/// buffer it was parsed from — nothing is copied out until [`Message::to_owned_message`]
/// is called.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    buffer: &'a [u8],
    msg_code: MsgCode,
    msg_type: MsgType,
    msg_id: u16,
    token: MsgToken,
    payload_start: usize,
}

impl<'a> Message<'a> {
    /// The minimum buffer size that can be passed to [`Message::decode`].
    pub const MIN_BUFFER_LEN: usize = 4;

    /// Parses a standalone UDP CoAP message out of `buffer`.
    pub fn decode(buffer: &'a [u8]) -> Result<Message<'a>, Error> {
        if buffer.len() < Self::MIN_BUFFER_LEN {
            return Err(Error::Truncated);
        }

        let msg_code = MsgCode::try_from(buffer[1]).ok_or(Error::InvalidOption)?;
        let msg_type = MsgType::try_from((buffer[0] & COAP_MSG_T_MASK) >> COAP_MSG_T_OFFS)
            .expect("2-bit field always decodes");
        let msg_id = ((buffer[2] as u16) << 8) | buffer[3] as u16;

        let token_len = (buffer[0] & COAP_MSG_TKL_MASK) as usize;
        if token_len > 8 || 4 + token_len > buffer.len() {
            return Err(Error::InvalidToken);
        }
        let token = MsgToken::new(&buffer[4..4 + token_len]);

        let mut iter = buffer[4 + token_len..].iter();
        let mut last = OptionNumber::default();
        let mut marker_seen = false;
        loop {
            match decode_option(&mut iter, last)? {
                DecodedOption::Option(number, _) => last = number,
                DecodedOption::PayloadMarker => {
                    marker_seen = true;
                    break;
                }
                DecodedOption::EndOfInput => break,
            }
        }

        // `decode_option` consumes the 0xFF payload marker itself, so the
        // iterator's remaining slice starts exactly at the payload (or at
        // end-of-buffer if there was no payload). A marker with nothing
        // after it promised a payload that never came.
        if marker_seen && iter.as_slice().is_empty() {
            return Err(Error::MissingPayload);
        }

        let consumed = iter.as_slice().as_ptr() as usize - buffer.as_ptr() as usize;

        Ok(Message {
            buffer,
            msg_code,
            msg_type,
            msg_id,
            token,
            payload_start: consumed,
        })
    }

    /// The message code.
    pub fn msg_code(&self) -> MsgCode {
        self.msg_code
    }

    /// The message type.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// The message id.
    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// The message token.
    pub fn msg_token(&self) -> MsgToken {
        self.token
    }

    /// The raw payload bytes.
    pub fn payload(&self) -> &'a [u8] {
        &self.buffer[self.payload_start..]
    }

    /// The payload decoded as a UTF-8 string, if valid.
    pub fn payload_as_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.payload()).ok()
    }

    /// An iterator over this message's options, in ascending option-number order.
    ///
    /// The slice handed to the iterator may include the trailing 0xFF payload
    /// marker; `OptionIterator` treats it as its own end-of-options signal.
    pub fn options(&self) -> OptionIterator<'a> {
        OptionIterator::new(&self.buffer[4 + self.token.len()..self.payload_start])
    }

    /// Looks up the first value for a typed option key.
    pub fn option<T>(&self, key: OptionKey<T>) -> Result<Option<T>, Error>
    where
        T: crate::option::TryOptionValueFrom<'a>,
    {
        self.options().find_next_of(key).transpose()
    }

    /// The `Content-Format` option, if present.
    pub fn content_format(&self) -> Result<Option<ContentFormat>, Error> {
        self.option(crate::option::CONTENT_FORMAT)
    }

    /// The `Accept` option, if present.
    pub fn accept(&self) -> Result<Option<ContentFormat>, Error> {
        self.option(crate::option::ACCEPT)
    }

    /// The `Block1` option, if present.
    pub fn block1(&self) -> Result<Option<BlockInfo>, Error> {
        self.option(crate::option::BLOCK1)
    }

    /// The `Block2` option, if present.
    pub fn block2(&self) -> Result<Option<BlockInfo>, Error> {
        self.option(crate::option::BLOCK2)
    }

    /// The `Observe` option, if present.
    pub fn observe(&self) -> Result<Option<u32>, Error> {
        self.option(crate::option::OBSERVE)
    }

    /// Returns the raw encoded bytes of this message.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buffer
    }

    /// Copies this message into an owned, mutable [`OwnedMessage`].
    pub fn to_owned_message(&self) -> OwnedMessage {
        let mut owned = OwnedMessage::new();
        owned.set_msg_type(self.msg_type);
        owned.set_msg_code(self.msg_code);
        owned.set_msg_id(self.msg_id);
        owned.set_msg_token(self.token);
        for opt in self.options() {
            let (number, value) = opt.expect("already-validated message");
            owned
                .insert_option_with_bytes(number, value)
                .expect("re-encoding a validated message cannot fail");
        }
        owned
            .append_payload_bytes(self.payload())
            .expect("re-encoding a validated message cannot fail");
        owned
    }
}

impl std::fmt::Display for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_message(
            f,
            self.msg_type,
            self.msg_code,
            self.msg_id,
            self.token,
            self.options(),
            self.payload(),
        )
    }
}

/// An owned, mutable CoAP message builder, backed by a heap-allocated buffer.
#[derive(Debug, Clone)]
pub struct OwnedMessage {
    buffer: Vec<u8>,
    option_start: usize,
    payload_start: usize,
    last_option: OptionNumber,
}

impl OwnedMessage {
    /// Creates a new, empty message (type `Con`, code `Empty`, no token).
    pub fn new() -> OwnedMessage {
        Self::with_payload_capacity(16)
    }

    /// Creates a new, empty message with the given payload capacity hint.
    pub fn with_payload_capacity(capacity: usize) -> OwnedMessage {
        let mut buffer = Vec::with_capacity(16 + capacity);
        buffer.push(0b0100_0000);
        buffer.resize(4, 0);

        OwnedMessage {
            buffer,
            option_start: 4,
            payload_start: 4,
            last_option: OptionNumber::default(),
        }
    }

    /// Sets the message type.
    pub fn set_msg_type(&mut self, tt: MsgType) {
        self.buffer[0] = (self.buffer[0] & !COAP_MSG_T_MASK) | ((tt as u8) << COAP_MSG_T_OFFS);
    }

    /// Sets the message id.
    pub fn set_msg_id(&mut self, msg_id: u16) {
        self.buffer[2] = (msg_id >> 8) as u8;
        self.buffer[3] = msg_id as u8;
    }

    /// Sets the message code.
    pub fn set_msg_code(&mut self, code: MsgCode) {
        self.buffer[1] = code as u8;
    }

    /// Sets the message token. Calling this after options/payload have been
    /// written discards them, matching the wire format's fixed token position.
    pub fn set_msg_token(&mut self, token: MsgToken) {
        if self.option_start != 4 + token.len() {
            self.buffer.resize(4 + token.len(), 0);
            self.option_start = self.buffer.len();
            self.payload_start = self.option_start;
            self.buffer[0] = (self.buffer[0] & !COAP_MSG_TKL_MASK) | token.len() as u8;
        }
        self.buffer[4..4 + token.len()].copy_from_slice(token.as_bytes());
    }

    /// Appends an option with a raw byte-slice value. Options must be inserted
    /// in ascending option-number order to avoid the (rare) reshuffle path.
    pub fn insert_option_with_bytes(&mut self, key: OptionNumber, value: &[u8]) -> Result<(), Error> {
        if self.last_option == key && !key.is_repeatable() {
            return Err(Error::InvalidOption);
        }
        key.validate(value)?;

        let option_start = self.option_start;
        let workspace = value.len() + 5;
        let len = self.buffer.len();
        self.buffer.resize(len + workspace, 0);

        let (mut new_len, last_option) = insert_option(
            &mut self.buffer[option_start..],
            len - option_start,
            self.last_option,
            key,
            value,
        )?;

        new_len += option_start;
        self.buffer.truncate(new_len);
        self.last_option = last_option;
        self.payload_start = new_len;

        Ok(())
    }

    /// Appends an option of a type with a known typed conversion.
    pub fn insert_option<'a, T>(&mut self, key: OptionKey<T>, value: T) -> Result<(), Error>
    where
        T: Into<crate::option::OptionValue<'a>>,
    {
        use crate::option::OptionValue;
        use crate::util::encode_u32;
        match value.into() {
            OptionValue::Integer(x) => self.insert_option_with_bytes(key.0, encode_u32(x, &mut [0; 4])),
            OptionValue::Bytes(x) => self.insert_option_with_bytes(key.0, x),
            OptionValue::ETag(x) => self.insert_option_with_bytes(key.0, x.as_bytes()),
        }
    }

    /// Appends bytes to the payload, writing the end-of-options marker first if needed.
    pub fn append_payload_bytes(&mut self, body: &[u8]) -> Result<(), Error> {
        if self.buffer.len() == self.payload_start {
            self.buffer.push(0xFF);
        }
        self.buffer.extend_from_slice(body);
        Ok(())
    }

    /// Appends a UTF-8 string to the payload.
    pub fn append_payload_string(&mut self, body: &str) -> Result<(), Error> {
        self.append_payload_bytes(body.as_bytes())
    }

    /// Replaces the payload, leaving type/code/id/token/options untouched.
    /// Used when a block-wise reassembly produces a body that differs from
    /// whatever chunk was originally decoded onto this message.
    pub fn set_payload(&mut self, body: &[u8]) -> Result<(), Error> {
        self.buffer.truncate(self.payload_start);
        self.append_payload_bytes(body)
    }

    /// Clears all options and payload, preserving type/code/id/token.
    pub fn clear(&mut self) {
        self.buffer.truncate(self.option_start);
        self.payload_start = self.option_start;
        self.last_option = OptionNumber::default();
    }

    /// The token currently set on this message.
    pub fn msg_token(&self) -> MsgToken {
        let token_len = (self.buffer[0] & COAP_MSG_TKL_MASK) as usize;
        MsgToken::new(&self.buffer[4..4 + token_len])
    }

    /// Returns the encoded message as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Parses this builder's own buffer back into a borrowed [`Message`].
    pub fn as_message(&self) -> Message<'_> {
        Message::decode(&self.buffer).expect("OwnedMessage always encodes a well-formed message")
    }
}

impl Default for OwnedMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl From<OwnedMessage> for Vec<u8> {
    fn from(msg: OwnedMessage) -> Self {
        msg.buffer
    }
}

impl std::ops::Deref for OwnedMessage {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::fmt::Display for OwnedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_message().fmt(f)
    }
}

/// Formats a raw datagram for logging, decoding it on the fly. Used by the
/// session driver to log inbound/outbound traffic without retaining a parsed
/// `Message` past the log statement.
#[derive(Copy, Clone)]
pub struct CoapByteDisplay<'a>(pub &'a [u8]);

impl std::fmt::Display for CoapByteDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match Message::decode(self.0) {
            Ok(msg) => msg.fmt(f),
            Err(e) => write!(f, "<CORRUPT {:?} {:02x?}>", e, self.0),
        }
    }
}

fn fmt_message(
    f: &mut std::fmt::Formatter<'_>,
    msg_type: MsgType,
    msg_code: MsgCode,
    msg_id: u16,
    token: MsgToken,
    options: OptionIterator<'_>,
    payload: &[u8],
) -> std::fmt::Result {
    write!(f, "<{:?} {:?} MID:{:04X}", msg_type, msg_code, msg_id)?;
    if !token.is_empty() {
        write!(f, " TOK:{}", token)?;
    }

    let mut content_format: Option<u16> = None;
    for option in options {
        match option {
            Ok((number, bytes)) => {
                if number == OptionNumber::CONTENT_FORMAT {
                    content_format = try_decode_u16(bytes);
                }
                f.write_str(" ")?;
                number.fmt_with_value(f, bytes)?;
            }
            Err(e) => return write!(f, " ERR:{:?}>", e),
        }
    }

    if !payload.is_empty() {
        let as_str = match content_format {
            Some(i) if i != ContentFormat::TEXT_PLAIN_UTF8.0 && i != ContentFormat::APPLICATION_JSON.0 => None,
            _ => std::str::from_utf8(payload).ok(),
        };
        match as_str {
            Some(s) => write!(f, " {:?}", s)?,
            None => write!(f, " {:?}", payload)?,
        }
    }

    write!(f, ">")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::msg_code::MsgCode;

    #[test]
    fn rfc7252_fig16_request() {
        let mut builder = OwnedMessage::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::MethodGet);
        builder.set_msg_id(0x7d34);
        builder
            .insert_option(crate::option::URI_PATH, "temperature")
            .unwrap();

        let expected: &[u8] = &[
            0b0100_0000, 1, 0x7d, 0x34, 0xbb, b't', b'e', b'm', b'p', b'e', b'r', b'a', b't', b'u', b'r', b'e',
        ];
        assert_eq!(builder.as_bytes(), expected);

        let parsed = Message::decode(expected).unwrap();
        assert_eq!(parsed.msg_type(), MsgType::Con);
        assert_eq!(parsed.msg_code(), MsgCode::MethodGet);
        assert_eq!(parsed.msg_id(), 0x7d34);
        assert_eq!(parsed.msg_token(), MsgToken::EMPTY);
        assert!(parsed.payload().is_empty());

        let mut iter = parsed.options();
        assert_eq!(iter.next(), Some(Ok((OptionNumber::URI_PATH, &b"temperature"[..]))));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn rfc7252_fig16_response() {
        let mut builder = OwnedMessage::new();
        builder.set_msg_type(MsgType::Ack);
        builder.set_msg_code(MsgCode::SuccessContent);
        builder.set_msg_id(0x7d34);
        builder.append_payload_string("22.3 C").unwrap();

        let expected: &[u8] = &[0b0110_0000, 69, 0x7d, 0x34, 0xff, b'2', b'2', b'.', b'3', b' ', b'C'];
        assert_eq!(builder.as_bytes(), expected);
    }

    #[test]
    fn round_trip_with_content_format_and_options() {
        let mut builder = OwnedMessage::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::MethodPost);
        builder.set_msg_id(0x7d34);
        builder.set_msg_token(MsgToken::from(0x2021u32));
        builder
            .insert_option(crate::option::CONTENT_FORMAT, ContentFormat::TEXT_PLAIN_UTF8)
            .unwrap();
        builder.insert_option(crate::option::URI_PATH, "temp").unwrap();
        builder.append_payload_string("22.3 C").unwrap();

        let parsed = Message::decode(builder.as_bytes()).unwrap();
        assert_eq!(parsed.msg_token(), MsgToken::from(0x2021u32));
        assert_eq!(parsed.content_format().unwrap(), Some(ContentFormat::TEXT_PLAIN_UTF8));
        assert_eq!(parsed.payload(), b"22.3 C");

        let mut iter = parsed.options();
        assert_eq!(iter.next(), Some(Ok((OptionNumber::URI_PATH, &b"temp"[..]))));
        assert_eq!(iter.next(), Some(Ok((OptionNumber::CONTENT_FORMAT, &b""[..]))));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert_eq!(Message::decode(&[0u8; 2]), Err(Error::Truncated));
    }

    #[test]
    fn oversized_token_length_is_rejected() {
        // TKL nibble = 9, which is already illegal (max 8).
        let buf = [0b0100_1001, 1, 0, 0];
        assert_eq!(Message::decode(&buf), Err(Error::InvalidToken));
    }

    #[test]
    fn empty_reset_message() {
        let mut builder = OwnedMessage::new();
        builder.set_msg_type(MsgType::Rst);
        builder.set_msg_code(MsgCode::Empty);
        builder.set_msg_id(0x1234);
        let parsed = Message::decode(builder.as_bytes()).unwrap();
        assert_eq!(parsed.msg_type(), MsgType::Rst);
        assert!(parsed.payload().is_empty());
    }

    #[test]
    fn payload_marker_with_no_payload_is_rejected() {
        // Header, no token, no options, then the 0xFF marker with nothing after it.
        let buf = [0b0100_0000, 1, 0x7d, 0x34, 0xff];
        assert_eq!(Message::decode(&buf), Err(Error::MissingPayload));
    }
}
