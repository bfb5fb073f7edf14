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

//! `coap-core` is the wire codec, reliability state machine, and tokio
//! session driver for a CoAP endpoint — no transport binding opinions
//! beyond the [`transport::Transport`] and [`acceptor::Listener`] seams,
//! so it serves equally as a client endpoint or the core of a server.
//!
//! Start at [`session::Session`] for a single remote peer, or
//! [`acceptor::Acceptor`] for a listening server that spins up a `Session`
//! per connecting remote.

pub mod acceptor;
pub mod block;
pub mod blockwise;
pub mod config;
pub mod consts;
pub mod content_format;
pub mod dedup;
pub mod error;
pub mod etag;
pub mod handler;
pub mod message;
pub mod option;
pub mod pool;
pub mod retransmit;
pub mod session;
pub mod tokens;
pub mod trans_params;
pub mod transport;
pub mod util;
pub mod worker_pool;

pub use config::Config;
pub use error::Error;
pub use session::Session;
