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

/// The CoAP message type: `CON`, `NON`, `ACK`, or `RST`.
#[derive(Debug, Copy, Eq, PartialEq, Clone)]
pub enum MsgType {
    /// Confirmable — requires an ACK or RST.
    Con = 0,

    /// Non-confirmable — no reliability at the message layer.
    Non = 1,

    /// Acknowledgement of a Confirmable message.
    Ack = 2,

    /// Reset, signalling that a message could not be processed.
    Rst = 3,
}

impl MsgType {
    /// Creates a `MsgType` from its 2-bit wire value, panicking if invalid.
    pub fn from(tt: u8) -> MsgType {
        MsgType::try_from(tt).expect("invalid message type")
    }

    /// Creates a `MsgType` from its 2-bit wire value.
    pub fn try_from(tt: u8) -> Option<MsgType> {
        match tt {
            0 => Some(MsgType::Con),
            1 => Some(MsgType::Non),
            2 => Some(MsgType::Ack),
            3 => Some(MsgType::Rst),
            _ => None,
        }
    }

    /// True if this is `NON`.
    pub fn is_non(self) -> bool {
        self == MsgType::Non
    }

    /// True if this is `CON`.
    pub fn is_con(self) -> bool {
        self == MsgType::Con
    }

    /// True if this is `ACK`.
    pub fn is_ack(self) -> bool {
        self == MsgType::Ack
    }

    /// True if this is `RST`.
    pub fn is_rst(self) -> bool {
        self == MsgType::Rst
    }
}

impl Default for MsgType {
    fn default() -> Self {
        MsgType::Con
    }
}
