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

use std::fmt::{Debug, Display, Formatter};

/// Error type covering decode, encode, protocol, timing, and lifecycle failures.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    // --- Decode ---
    /// The datagram ended before a complete message could be parsed.
    Truncated,

    /// An option or payload-marker nibble used the reserved value 15.
    ReservedNibble,

    /// The cumulative option delta exceeded 65535.
    OptionOverflow,

    /// The token-length field declared more than 8 bytes.
    InvalidToken,

    /// The decoded message exceeded `Config::max_message_size`.
    MessageTooLarge,

    /// The payload marker (0xFF) was present but not followed by any bytes.
    MissingPayload,

    // --- Encode ---
    /// The destination buffer was not large enough to hold the encoded message.
    BufferTooSmall,

    /// An option's value violated its declared length bounds.
    InvalidOption,

    // --- Protocol ---
    /// An unrecognised critical option was present (response: 4.02 Bad Option).
    BadOption,

    /// A block-wise request's middle block had a size mismatch (4.08).
    RequestEntityIncomplete,

    /// A block-wise assembly buffer overflowed its maximum size (4.13).
    RequestEntityTooLarge,

    /// The peer sent a Reset in response to a Confirmable message.
    Reset,

    // --- Timing ---
    /// `MAX_RETRANSMIT` attempts elapsed with no ACK or RST.
    TransmitTimeout,

    /// A block-wise transfer was idle past its configured timeout.
    BlockTransferTimeout,

    /// An observe notification arrived out of order per the freshness rule.
    ObserveStale,

    // --- Lifecycle ---
    /// The operation was cancelled via its cancellation token.
    Cancelled,

    /// A datagram was dropped because the worker pool rejected the submission.
    Overloaded,

    /// The session or observation has already terminated.
    Closed,

    /// An I/O error occurred on the underlying transport.
    IoError,

    /// An unspecified error occurred.
    Unspecified,
}

impl Error {
    /// Returns true if this error originated while parsing an inbound datagram.
    pub fn is_decode_error(self) -> bool {
        matches!(
            self,
            Error::Truncated
                | Error::ReservedNibble
                | Error::OptionOverflow
                | Error::InvalidToken
                | Error::MessageTooLarge
                | Error::MissingPayload
        )
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IoError
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <Self as Debug>::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl Default for Error {
    fn default() -> Self {
        Error::Unspecified
    }
}
