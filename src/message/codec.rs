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

//! Low-level option codec: the delta/length TLV encoding shared by every
//! option in a CoAP message's option block.

use crate::error::Error;
use crate::option::{OptionNumber, MAX_OPTION_VALUE_SIZE};

/// Calculates the encoded size of a single option, value included.
pub fn calc_option_size(prev_key: OptionNumber, key: OptionNumber, mut value_len: usize) -> usize {
    if value_len >= 269 {
        value_len += 2;
    } else if value_len >= 13 {
        value_len += 1;
    }

    let option_delta = (key - prev_key) as u16;

    if option_delta >= 269 {
        value_len += 3;
    } else if option_delta >= 13 {
        value_len += 2;
    } else {
        value_len += 1;
    }

    value_len
}

/// What [`decode_option`] found at the front of the iterator.
///
/// Kept distinct from a plain `Option` so callers that care (the top-level
/// message decode loop) can tell "saw the 0xFF payload marker" apart from
/// "ran out of option bytes with no marker at all" — both leave the
/// iterator empty, but only the former means a payload is expected.
#[derive(Debug, Eq, PartialEq)]
pub enum DecodedOption<'a> {
    Option(OptionNumber, &'a [u8]),
    /// The `0xFF` end-of-options/start-of-payload marker was consumed.
    PayloadMarker,
    /// The iterator ran out of bytes with no marker seen.
    EndOfInput,
}

impl<'a> DecodedOption<'a> {
    /// Collapses `PayloadMarker`/`EndOfInput` together, for callers that
    /// only care about "another option" vs. "no more options".
    pub fn into_option(self) -> Option<(OptionNumber, &'a [u8])> {
        match self {
            DecodedOption::Option(number, value) => Some((number, value)),
            DecodedOption::PayloadMarker | DecodedOption::EndOfInput => None,
        }
    }
}

/// Decodes one option from a `core::slice::Iter` over an option block,
/// advancing the iterator past it.
pub fn decode_option<'a>(
    iter: &mut core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
) -> Result<DecodedOption<'a>, Error> {
    macro_rules! try_next {
        ($iter:expr, $none:expr) => {
            match ($iter).next() {
                Some(x) => *x,
                None => return $none,
            }
        };
    }

    let header: u8 = try_next!(iter, Ok(DecodedOption::EndOfInput));

    if header == 0xFF {
        return Ok(DecodedOption::PayloadMarker);
    }

    let key_delta: u16 = match header >> 4 {
        13 => 13u16 + try_next!(iter, Err(Error::Truncated)) as u16,
        14 => {
            let msb = try_next!(iter, Err(Error::Truncated)) as u16;
            269u16 + try_next!(iter, Err(Error::Truncated)) as u16 + (msb << 8)
        }
        15 => return Err(Error::ReservedNibble),
        key => key as u16,
    };

    let len = match header & 0xF {
        13 => (13 + try_next!(iter, Err(Error::Truncated))) as usize,
        14 => {
            let msb = try_next!(iter, Err(Error::Truncated)) as u16;
            (269u16 + try_next!(iter, Err(Error::Truncated)) as u16 + (msb << 8)) as usize
        }
        15 => return Err(Error::ReservedNibble),
        len => len as usize,
    };

    if last_option.0 > u16::MAX - key_delta {
        return Err(Error::OptionOverflow);
    }

    if len == 0 {
        return Ok(DecodedOption::Option(last_option + key_delta, &[]));
    }

    let remaining = iter.as_slice();
    if len > remaining.len() {
        return Err(Error::Truncated);
    }

    let value: &'a [u8] = &remaining[..len];
    iter.nth(len - 1);

    Ok(DecodedOption::Option(last_option + key_delta, value))
}

/// Encodes all parts of an option *except* its value. Used by [`insert_option`]
/// to re-encode a header in place; [`encode_option`] is the usual entry point.
pub fn encode_option_without_value(
    buffer: &mut [u8],
    prev_key: OptionNumber,
    key: OptionNumber,
    value_len: usize,
) -> Result<usize, Error> {
    if prev_key > key {
        return Err(Error::InvalidOption);
    }

    if value_len > MAX_OPTION_VALUE_SIZE {
        return Err(Error::OptionOverflow);
    }

    let calc_len = calc_option_size(prev_key, key, value_len);
    if calc_len > buffer.len() {
        return Err(Error::BufferTooSmall);
    }

    let mut value_offset = 1;
    let mut option_delta = key - prev_key;

    if option_delta >= 269 {
        option_delta -= 269;
        buffer[0] = 14 << 4;
        buffer[1] = (option_delta >> 8) as u8;
        buffer[2] = option_delta as u8;
        value_offset += 2;
    } else if option_delta >= 13 {
        buffer[0] = 13 << 4;
        buffer[1] = (option_delta - 13) as u8;
        value_offset += 1;
    } else {
        buffer[0] = (option_delta << 4) as u8;
    }

    if value_len >= 269 {
        buffer[0] |= 14;
        buffer[value_offset] = ((value_len - 269) >> 8) as u8;
        buffer[value_offset + 1] = (value_len - 269) as u8;
        value_offset += 2;
    } else if value_len >= 13 {
        buffer[0] |= 13;
        buffer[value_offset] = (value_len - 13) as u8;
        value_offset += 1;
    } else {
        buffer[0] |= (value_len & 15) as u8;
    }

    Ok(value_offset + value_len)
}

/// Encodes an option, value included, into `buffer`.
pub fn encode_option(
    key: OptionNumber,
    value: &[u8],
    prev_key: OptionNumber,
    buffer: &mut [u8],
) -> Result<&[u8], Error> {
    let option_len = encode_option_without_value(buffer, prev_key, key, value.len())?;
    buffer[option_len - value.len()..option_len].copy_from_slice(value);
    Ok(&buffer[..option_len])
}

/// Where to split an option block and how to re-encode around the split,
/// for [`insert_option`]'s out-of-order insertion path.
fn insert_split_helper(
    buffer: &[u8],
    key: OptionNumber,
) -> Result<(usize, OptionNumber, OptionNumber, usize, usize), Error> {
    let mut prev_option_key = OptionNumber(0);
    let mut split_index;

    let mut iter = buffer.iter();
    let mut last = OptionNumber::default();

    loop {
        split_index = iter.as_slice().as_ptr() as usize - buffer.as_ptr() as usize;

        let (next_key, next_value) = match decode_option(&mut iter, last)? {
            DecodedOption::Option(number, value) => (number, value),
            DecodedOption::PayloadMarker | DecodedOption::EndOfInput => {
                panic!("unexpected end of options while inserting")
            }
        };
        last = next_key;

        if next_key > key {
            let next_option_size =
                iter.as_slice().as_ptr() as usize - buffer.as_ptr() as usize - split_index;
            return Ok((
                split_index,
                prev_option_key,
                next_key,
                next_value.len(),
                next_option_size,
            ));
        }

        prev_option_key = next_key;
    }
}

/// Inserts an option into an already-encoded option block. Appending
/// (`key >= last_option`) is O(1); inserting out of order requires shifting
/// everything after the insertion point and is only used rarely.
pub fn insert_option(
    buffer: &mut [u8],
    mut len: usize,
    last_option: OptionNumber,
    key: OptionNumber,
    value: &[u8],
) -> Result<(usize, OptionNumber), Error> {
    if value.len() > MAX_OPTION_VALUE_SIZE {
        return Err(Error::OptionOverflow);
    }

    if key >= last_option {
        len += encode_option(key, value, last_option, &mut buffer[len..])?.len();
        return Ok((len, key));
    }

    let (split_index, prev_option_key, next_option_key, next_option_value_len, next_option_size) =
        insert_split_helper(&buffer[..len], key)?;

    let key_delta_size_adj =
        next_option_size - calc_option_size(key, next_option_key, next_option_value_len);
    let new_option_size = calc_option_size(prev_option_key, key, value.len());
    let adj_size = new_option_size - key_delta_size_adj;

    if len + adj_size > buffer.len() {
        return Err(Error::BufferTooSmall);
    }

    let src = split_index..len;
    let dest = split_index + adj_size;
    buffer.copy_within(src, dest);
    len += adj_size;

    encode_option(
        key,
        value,
        prev_option_key,
        &mut buffer[split_index..split_index + new_option_size],
    )
    .expect("internal inconsistency inserting option");

    if key != prev_option_key {
        encode_option_without_value(
            &mut buffer[split_index + new_option_size..],
            key,
            next_option_key,
            next_option_value_len,
        )
        .expect("internal inconsistency inserting option");
    }

    Ok((len, last_option))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_option() {
        let mut buf = [0u8; 32];
        let written = encode_option(OptionNumber::URI_PATH, b"temperature", OptionNumber::default(), &mut buf)
            .unwrap()
            .len();
        let mut iter = buf[..written].iter();
        let (num, value) = decode_option(&mut iter, OptionNumber::default())
            .unwrap()
            .into_option()
            .unwrap();
        assert_eq!(num, OptionNumber::URI_PATH);
        assert_eq!(value, b"temperature");
        assert_eq!(decode_option(&mut iter, num).unwrap(), DecodedOption::EndOfInput);
    }

    #[test]
    fn reserved_nibble_rejected() {
        let buf = [0xF0u8];
        let mut iter = buf.iter();
        assert_eq!(
            decode_option(&mut iter, OptionNumber::default()),
            Err(Error::ReservedNibble)
        );
    }

    #[test]
    fn truncated_header_rejected() {
        let buf = [0xD0u8];
        let mut iter = buf.iter();
        assert_eq!(decode_option(&mut iter, OptionNumber::default()), Err(Error::Truncated));
    }

    #[test]
    fn end_of_options_marker_stops_iteration() {
        let buf = [0xFFu8, 1, 2, 3];
        let mut iter = buf.iter();
        assert_eq!(
            decode_option(&mut iter, OptionNumber::default()),
            Ok(DecodedOption::PayloadMarker)
        );
        assert_eq!(iter.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn end_of_input_without_marker_is_distinguished_from_marker() {
        let buf: [u8; 0] = [];
        let mut iter = buf.iter();
        assert_eq!(
            decode_option(&mut iter, OptionNumber::default()),
            Ok(DecodedOption::EndOfInput)
        );
    }

    #[test]
    fn insert_out_of_order() {
        let mut buf = [0u8; 64];
        let mut len = 0;
        let mut last = OptionNumber::default();

        let (new_len, new_last) =
            insert_option(&mut buf, len, last, OptionNumber::URI_PATH, b"b").unwrap();
        len = new_len;
        last = new_last;

        let (new_len, new_last) =
            insert_option(&mut buf, len, last, OptionNumber::CONTENT_FORMAT, &[0]).unwrap();
        len = new_len;
        last = new_last;

        // Out-of-order insert: ETAG (4) comes before URI_PATH (11) and CONTENT_FORMAT (12).
        let (new_len, _) = insert_option(&mut buf, len, last, OptionNumber::ETAG, b"x").unwrap();
        len = new_len;

        let mut iter = buf[..len].iter();
        let mut cursor = OptionNumber::default();
        let (n1, v1) = decode_option(&mut iter, cursor).unwrap().into_option().unwrap();
        cursor = n1;
        assert_eq!(n1, OptionNumber::ETAG);
        assert_eq!(v1, b"x");

        let (n2, v2) = decode_option(&mut iter, cursor).unwrap().into_option().unwrap();
        cursor = n2;
        assert_eq!(n2, OptionNumber::URI_PATH);
        assert_eq!(v2, b"b");

        let (n3, _) = decode_option(&mut iter, cursor).unwrap().into_option().unwrap();
        assert_eq!(n3, OptionNumber::CONTENT_FORMAT);
    }
}
