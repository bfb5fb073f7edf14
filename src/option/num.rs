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

use crate::block::BlockInfo;
use crate::content_format::ContentFormat;
use crate::error::Error;
use crate::util::{try_decode_u16, try_decode_u32};

/// The value format expected for a given option number.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OptionValueType {
    /// No value at all (e.g. If-None-Match).
    Flag,

    /// An opaque byte string.
    Opaque,

    /// A UTF-8 string.
    String,

    /// An unsigned integer, encoded big-endian with no leading zero bytes.
    Integer,

    /// A Block1/Block2 packed integer.
    Block,

    /// A Content-Format/Accept registry value.
    ContentFormat,
}

/// A CoAP option number, with the standard option table baked in as
/// inherent consts.
#[derive(Copy, Eq, PartialEq, Hash, Clone, Ord, PartialOrd)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    /// If-Match.
    pub const IF_MATCH: OptionNumber = OptionNumber(1);
    /// Uri-Host.
    pub const URI_HOST: OptionNumber = OptionNumber(3);
    /// ETag.
    pub const ETAG: OptionNumber = OptionNumber(4);
    /// If-None-Match.
    pub const IF_NONE_MATCH: OptionNumber = OptionNumber(5);
    /// Observe.
    pub const OBSERVE: OptionNumber = OptionNumber(6);
    /// Uri-Port.
    pub const URI_PORT: OptionNumber = OptionNumber(7);
    /// Location-Path.
    pub const LOCATION_PATH: OptionNumber = OptionNumber(8);
    /// Uri-Path.
    pub const URI_PATH: OptionNumber = OptionNumber(11);
    /// Content-Format.
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);
    /// Max-Age.
    pub const MAX_AGE: OptionNumber = OptionNumber(14);
    /// Uri-Query.
    pub const URI_QUERY: OptionNumber = OptionNumber(15);
    /// Accept.
    pub const ACCEPT: OptionNumber = OptionNumber(17);
    /// Location-Query.
    pub const LOCATION_QUERY: OptionNumber = OptionNumber(20);
    /// Block2.
    pub const BLOCK2: OptionNumber = OptionNumber(23);
    /// Block1.
    pub const BLOCK1: OptionNumber = OptionNumber(27);
    /// Size2.
    pub const SIZE2: OptionNumber = OptionNumber(28);
    /// Proxy-Uri.
    pub const PROXY_URI: OptionNumber = OptionNumber(35);
    /// Proxy-Scheme.
    pub const PROXY_SCHEME: OptionNumber = OptionNumber(39);
    /// Size1.
    pub const SIZE1: OptionNumber = OptionNumber(60);

    /// True if this option number is critical (bit 0 of the number is set).
    pub fn is_critical(self) -> bool {
        const FLAG_CRITICAL: u16 = 1;
        self.0 & FLAG_CRITICAL == FLAG_CRITICAL
    }

    /// True if this option is "un-safe" to forward through a proxy.
    pub fn is_un_safe(self) -> bool {
        const FLAG_UN_SAFE: u16 = 2;
        self.0 & FLAG_UN_SAFE == FLAG_UN_SAFE
    }

    /// True if this option is excluded from the block-wise cache key
    /// used to correlate blocks belonging to the same transfer.
    pub fn is_no_cache_key(self) -> bool {
        const FLAG_NO_CACHE_KEY_MASK: u16 = 0x1e;
        const FLAG_NO_CACHE_KEY_MAGIC: u16 = 0x1c;
        self.0 & FLAG_NO_CACHE_KEY_MASK == FLAG_NO_CACHE_KEY_MAGIC
    }

    /// The expected value format for this option number.
    pub fn option_value_type(self) -> OptionValueType {
        match self {
            OptionNumber::IF_MATCH => OptionValueType::Opaque,
            OptionNumber::URI_HOST => OptionValueType::String,
            OptionNumber::ETAG => OptionValueType::Opaque,
            OptionNumber::IF_NONE_MATCH => OptionValueType::Flag,
            OptionNumber::OBSERVE => OptionValueType::Integer,
            OptionNumber::URI_PORT => OptionValueType::Integer,
            OptionNumber::LOCATION_PATH => OptionValueType::String,
            OptionNumber::URI_PATH => OptionValueType::String,
            OptionNumber::CONTENT_FORMAT => OptionValueType::ContentFormat,
            OptionNumber::MAX_AGE => OptionValueType::Integer,
            OptionNumber::URI_QUERY => OptionValueType::String,
            OptionNumber::ACCEPT => OptionValueType::ContentFormat,
            OptionNumber::LOCATION_QUERY => OptionValueType::String,
            OptionNumber::BLOCK2 => OptionValueType::Block,
            OptionNumber::BLOCK1 => OptionValueType::Block,
            OptionNumber::SIZE2 => OptionValueType::Integer,
            OptionNumber::PROXY_URI => OptionValueType::String,
            OptionNumber::PROXY_SCHEME => OptionValueType::String,
            OptionNumber::SIZE1 => OptionValueType::Integer,
            OptionNumber(_) => OptionValueType::Opaque,
        }
    }

    /// True if more than one instance of this option is allowed in a message.
    pub fn is_repeatable(self) -> bool {
        match self {
            OptionNumber::IF_MATCH => true,
            OptionNumber::URI_HOST => false,
            OptionNumber::ETAG => true,
            OptionNumber::IF_NONE_MATCH => false,
            OptionNumber::OBSERVE => false,
            OptionNumber::URI_PORT => false,
            OptionNumber::LOCATION_PATH => true,
            OptionNumber::URI_PATH => true,
            OptionNumber::CONTENT_FORMAT => false,
            OptionNumber::MAX_AGE => false,
            OptionNumber::URI_QUERY => true,
            OptionNumber::ACCEPT => false,
            OptionNumber::LOCATION_QUERY => true,
            OptionNumber::BLOCK2 => false,
            OptionNumber::BLOCK1 => false,
            OptionNumber::SIZE2 => false,
            OptionNumber::PROXY_URI => false,
            OptionNumber::PROXY_SCHEME => false,
            OptionNumber::SIZE1 => false,
            // Unknown options default to repeatable: permissive towards options
            // this table doesn't recognise.
            OptionNumber(_) => true,
        }
    }

    /// Minimum/maximum legal value length in bytes, per RFC7252 Table 4.
    pub fn length_bounds(self) -> (usize, usize) {
        match self {
            OptionNumber::IF_MATCH => (0, 8),
            OptionNumber::URI_HOST => (1, 255),
            OptionNumber::ETAG => (1, 8),
            OptionNumber::IF_NONE_MATCH => (0, 0),
            OptionNumber::OBSERVE => (0, 3),
            OptionNumber::URI_PORT => (0, 2),
            OptionNumber::LOCATION_PATH => (0, 255),
            OptionNumber::URI_PATH => (0, 255),
            OptionNumber::CONTENT_FORMAT => (0, 2),
            OptionNumber::MAX_AGE => (0, 4),
            OptionNumber::URI_QUERY => (0, 255),
            OptionNumber::ACCEPT => (0, 2),
            OptionNumber::LOCATION_QUERY => (0, 255),
            OptionNumber::BLOCK2 => (0, 3),
            OptionNumber::BLOCK1 => (0, 3),
            OptionNumber::SIZE2 => (0, 4),
            OptionNumber::PROXY_URI => (1, 1034),
            OptionNumber::PROXY_SCHEME => (1, 255),
            OptionNumber::SIZE1 => (0, 4),
            OptionNumber(_) => (0, usize::MAX),
        }
    }

    /// Validates a candidate value against this option's declared length bounds
    /// and, for `Block`/`Integer`/`ContentFormat` formats, its decodability.
    pub fn validate(self, value: &[u8]) -> Result<(), Error> {
        let (min, max) = self.length_bounds();
        if value.len() < min || value.len() > max {
            return Err(Error::InvalidOption);
        }

        match self.option_value_type() {
            OptionValueType::Integer => {
                if try_decode_u32(value).is_none() {
                    return Err(Error::InvalidOption);
                }
            }
            OptionValueType::ContentFormat => {
                if try_decode_u16(value).is_none() {
                    return Err(Error::InvalidOption);
                }
            }
            OptionValueType::Block => {
                if try_decode_u32(value).is_none() {
                    return Err(Error::InvalidOption);
                }
            }
            OptionValueType::String => {
                if std::str::from_utf8(value).is_err() {
                    return Err(Error::InvalidOption);
                }
            }
            OptionValueType::Flag | OptionValueType::Opaque => {}
        }

        Ok(())
    }

    /// Human-readable name of this option, if it is one this table recognises.
    pub fn static_name(self) -> Option<&'static str> {
        match self {
            OptionNumber::IF_MATCH => Some("If-Match"),
            OptionNumber::URI_HOST => Some("Uri-Host"),
            OptionNumber::ETAG => Some("ETag"),
            OptionNumber::IF_NONE_MATCH => Some("If-None-Match"),
            OptionNumber::OBSERVE => Some("Observe"),
            OptionNumber::URI_PORT => Some("Uri-Port"),
            OptionNumber::LOCATION_PATH => Some("Location-Path"),
            OptionNumber::URI_PATH => Some("Uri-Path"),
            OptionNumber::CONTENT_FORMAT => Some("Content-Format"),
            OptionNumber::MAX_AGE => Some("Max-Age"),
            OptionNumber::URI_QUERY => Some("Uri-Query"),
            OptionNumber::ACCEPT => Some("Accept"),
            OptionNumber::LOCATION_QUERY => Some("Location-Query"),
            OptionNumber::BLOCK2 => Some("Block2"),
            OptionNumber::BLOCK1 => Some("Block1"),
            OptionNumber::SIZE2 => Some("Size2"),
            OptionNumber::PROXY_URI => Some("Proxy-Uri"),
            OptionNumber::PROXY_SCHEME => Some("Proxy-Scheme"),
            OptionNumber::SIZE1 => Some("Size1"),
            _ => None,
        }
    }

    /// Formats this option number with a decoded preview of its value, for logging.
    pub fn fmt_with_value(self, f: &mut std::fmt::Formatter<'_>, value: &[u8]) -> std::fmt::Result {
        write!(f, "{}", self)?;
        match self.option_value_type() {
            OptionValueType::Opaque | OptionValueType::Flag => {
                if !value.is_empty() {
                    f.write_str(":")?;
                    for b in value {
                        write!(f, "{:02X}", b)?;
                    }
                }
            }
            OptionValueType::Integer => match try_decode_u32(value) {
                Some(i) => write!(f, ":{}", i)?,
                None => f.write_str(":ERR")?,
            },
            OptionValueType::Block => match try_decode_u32(value) {
                Some(i) => write!(f, ":{}", BlockInfo(i))?,
                None => f.write_str(":ERR")?,
            },
            OptionValueType::ContentFormat => match try_decode_u16(value) {
                Some(i) => write!(f, ":{}", ContentFormat(i))?,
                None => f.write_str(":ERR")?,
            },
            OptionValueType::String => match std::str::from_utf8(value) {
                Ok(s) => write!(f, ":{:?}", s)?,
                Err(_) => f.write_str(":ERR")?,
            },
        }
        Ok(())
    }
}

impl std::fmt::Display for OptionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = self.static_name() {
            f.write_str(name)
        } else {
            if self.is_critical() {
                f.write_str("Crit-")?;
            } else {
                f.write_str("Opt-")?;
            }
            if self.is_un_safe() {
                f.write_str("UnSafe-")?;
            }
            if self.is_no_cache_key() {
                f.write_str("NoCacheKey-")?;
            }
            write!(f, "{}", self.0)
        }
    }
}

impl std::fmt::Debug for OptionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.0, self)
    }
}

impl std::ops::Add<u16> for OptionNumber {
    type Output = Self;
    fn add(self, other: u16) -> Self {
        OptionNumber(self.0 + other)
    }
}

impl std::ops::Sub<OptionNumber> for OptionNumber {
    type Output = u16;
    fn sub(self, other: OptionNumber) -> u16 {
        assert!(self.0 >= other.0);
        self.0 - other.0
    }
}

impl Default for OptionNumber {
    fn default() -> Self {
        OptionNumber(0)
    }
}

/// Looks up the descriptor for an option number. Always succeeds: unknown
/// numbers fall back to permissive defaults (opaque, repeatable, unbounded).
pub fn lookup(number: OptionNumber) -> OptionNumber {
    number
}

/// Value format for the given option number.
pub fn format_of(number: OptionNumber) -> OptionValueType {
    number.option_value_type()
}

/// True if more than one instance of this option number is permitted.
pub fn is_repeatable(number: OptionNumber) -> bool {
    number.is_repeatable()
}

/// Validates a value against an option number's declared bounds.
pub fn validate(number: OptionNumber, value: &[u8]) -> Result<(), Error> {
    number.validate(value)
}
