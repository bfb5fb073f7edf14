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

//! Wire-level CoAP message representation: header bits, the option TLV
//! codec, and the concrete borrowed/owned message types built on top of it.

/// Type for representing a CoAP message id.
pub type MsgId = u16;

pub mod codec;

mod msg_code;
pub use msg_code::{MsgCode, MsgCodeClass};

mod msg_type;
pub use msg_type::MsgType;

mod token;
pub use token::MsgToken;

mod message;
pub use message::{CoapByteDisplay, Message, OwnedMessage};

#[allow(dead_code)]
const COAP_MSG_VER_MASK: u8 = 0b1100_0000;
const COAP_MSG_T_MASK: u8 = 0b0011_0000;
const COAP_MSG_T_OFFS: u8 = 4;
const COAP_MSG_TKL_MASK: u8 = 0b0000_1111;
