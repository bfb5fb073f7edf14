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

use crate::util::encode_u32;
use std::ops::Deref;

/// Value of a CoAP message token (opaque, 0..8 bytes).
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct MsgToken {
    len: u8,
    bytes: [u8; 8],
}

impl MsgToken {
    /// An empty token.
    pub const EMPTY: MsgToken = MsgToken {
        len: 0u8,
        bytes: [0; 8],
    };

    /// Creates a new token from the given byte slice. Panics if `x.len() > 8`.
    pub fn new(x: &[u8]) -> MsgToken {
        MsgToken::from(x)
    }

    /// Generates a fresh token using at least 4 random bytes, so that
    /// tokens are not predictable to an off-path attacker.
    pub fn generate() -> MsgToken {
        let mut bytes = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes[..4]);
        MsgToken { len: 4, bytes }
    }

    /// Length of this token, in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if this token is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns this token's value as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for MsgToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl Default for MsgToken {
    fn default() -> Self {
        MsgToken::EMPTY
    }
}

impl Deref for MsgToken {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl PartialEq<[u8]> for MsgToken {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl From<u32> for MsgToken {
    fn from(x: u32) -> Self {
        let mut bytes = [0u8; 8];
        let len = encode_u32(x, &mut bytes).len();
        MsgToken {
            len: len as u8,
            bytes,
        }
    }
}

impl From<&[u8]> for MsgToken {
    fn from(x: &[u8]) -> Self {
        assert!(x.len() <= 8, "token too long");
        let mut bytes = [0u8; 8];
        let len = x.len();
        bytes[..len].copy_from_slice(x);
        MsgToken {
            len: len as u8,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_at_least_four_bytes() {
        let token = MsgToken::generate();
        assert!(token.len() >= 4);
    }

    #[test]
    fn round_trip() {
        let token = MsgToken::new(&[1, 2, 3]);
        assert_eq!(token.as_bytes(), &[1, 2, 3]);
        assert_eq!(format!("{}", token), "010203");
    }

    #[test]
    fn max_length_round_trips() {
        let bytes = [0u8; 8];
        let token = MsgToken::new(&bytes);
        assert_eq!(token.len(), 8);
    }
}
