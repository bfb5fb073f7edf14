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

use super::*;
use crate::util::encode_u32;
use std::convert::Into;

/// A convenience iterator for parsing options out of a message's option block.
#[derive(Debug, Clone)]
pub struct OptionIterator<'a> {
    iter: core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
}

impl<'a> Default for OptionIterator<'a> {
    fn default() -> Self {
        OptionIterator::new(&[])
    }
}

impl<'a> OptionIterator<'a> {
    /// Creates a new instance of an `OptionIterator` over the given byte slice.
    pub fn new(buffer: &'a [u8]) -> OptionIterator<'a> {
        OptionIterator {
            iter: buffer.iter(),
            last_option: Default::default(),
        }
    }

    /// Returns the unread remaining options as a byte slice.
    pub fn as_slice(&self) -> &'a [u8] {
        self.iter.as_slice()
    }

    /// Peeks ahead to the next option without moving the iterator forward.
    pub fn peek(&mut self) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        match crate::message::codec::decode_option(&mut self.iter.clone(), self.last_option) {
            Ok(decoded) => decoded.into_option().map(Ok),
            Err(e) => Some(Err(e)),
        }
    }

    /// Determines if the next option has a specific number and value without
    /// moving the iterator forward.
    pub fn peek_eq<T>(&mut self, key: OptionKey<T>, value: T) -> bool
    where
        T: Into<OptionValue<'a>>,
    {
        let mut temp_array = [0; 8];
        match crate::message::codec::decode_option(&mut self.iter.clone(), self.last_option) {
            Ok(crate::message::codec::DecodedOption::Option(number, iter_value)) => {
                number == key.0
                    && (match value.into() {
                        OptionValue::Integer(x) => encode_u32(x, &mut temp_array),
                        OptionValue::Bytes(x) => x,
                        OptionValue::ETag(x) => {
                            let temp_slice = &mut temp_array[0..x.len()];
                            temp_slice.copy_from_slice(x.as_bytes());
                            temp_slice
                        }
                    } == iter_value)
            }
            _ => false,
        }
    }
}

impl<'a> Iterator for OptionIterator<'a> {
    type Item = Result<(OptionNumber, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let ret = match crate::message::codec::decode_option(&mut self.iter, self.last_option) {
            Ok(decoded) => decoded.into_option().map(Ok),
            Err(e) => Some(Err(e)),
        };
        if let Some(Ok((key, _))) = ret {
            self.last_option = key;
        }
        ret
    }
}

impl AsRef<[u8]> for OptionIterator<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Extension trait for option iterators providing typed, sorted-scan accessors.
pub trait OptionIteratorExt<'a>: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> {
    /// Moves the iterator forward until it finds a matching option number or
    /// the point at which it would have appeared. Does not consume any
    /// options after the matching one.
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>>;

    /// Typed version of [`OptionIteratorExt::find_next`].
    fn find_next_of<T>(&mut self, key: OptionKey<T>) -> Option<Result<T, Error>>
    where
        T: TryOptionValueFrom<'a> + Sized,
    {
        match self.find_next(key.0)? {
            Ok((_, value)) => match T::try_option_value_from(value) {
                Some(x) => Some(Ok(x)),
                None => Some(Err(Error::InvalidOption)),
            },
            Err(e) => Some(Err(e)),
        }
    }
}

impl<'a, I> OptionIteratorExt<'a> for I
where
    I: Iterator<Item = Result<(OptionNumber, &'a [u8]), Error>> + Sized + Clone,
{
    fn find_next(&mut self, key: OptionNumber) -> Option<Result<(OptionNumber, &'a [u8]), Error>> {
        let next_value = loop {
            let mut iter = self.clone();

            match iter.next()? {
                Err(x) => return Some(Err(x)),
                Ok((number, value)) => {
                    if number == key {
                        *self = iter;
                        break (key, value);
                    }
                    if number < key.0 {
                        *self = iter;
                        continue;
                    }
                }
            };

            return None;
        };

        Some(Ok(next_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::codec::encode_option;

    fn build(pairs: &[(OptionNumber, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut last = OptionNumber::default();
        for (num, value) in pairs {
            let mut scratch = vec![0u8; 16 + value.len()];
            let written = encode_option(*num, value, last, &mut scratch).unwrap();
            buf.extend_from_slice(written);
            last = *num;
        }
        buf
    }

    #[test]
    fn iterates_in_order() {
        let buf = build(&[
            (OptionNumber::URI_PATH, b"a"),
            (OptionNumber::URI_PATH, b"b"),
            (OptionNumber::CONTENT_FORMAT, &[0]),
        ]);
        let items: Vec<_> = OptionIterator::new(&buf).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].0, OptionNumber::URI_PATH);
        assert_eq!(items[2].0, OptionNumber::CONTENT_FORMAT);
    }

    #[test]
    fn find_next_of_skips_unwanted() {
        let buf = build(&[
            (OptionNumber::URI_PATH, b"a"),
            (OptionNumber::CONTENT_FORMAT, &[0]),
        ]);
        let mut iter = OptionIterator::new(&buf);
        let cf = iter.find_next_of(CONTENT_FORMAT).unwrap().unwrap();
        assert_eq!(cf, ContentFormat(0));
    }
}
