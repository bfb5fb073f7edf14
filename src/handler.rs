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

//! The user-facing surface: request handlers, the response builder handed
//! to them, and the observation handle returned from an Observe request.

use crate::content_format::ContentFormat;
use crate::error::Error;
use crate::message::{MsgCode, MsgToken, MsgType, OwnedMessage};
use crate::option::OptionKey;
use crate::tokens::TokenRegistry;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Builder the driver hands to a [`Handler`] for it to describe the
/// response to send once it returns.
#[derive(Debug)]
pub struct ResponseWriter {
    code: MsgCode,
    payload: Vec<u8>,
    message: OwnedMessage,
}

impl ResponseWriter {
    pub(crate) fn new() -> ResponseWriter {
        ResponseWriter {
            code: MsgCode::Empty,
            payload: Vec::new(),
            message: OwnedMessage::new(),
        }
    }

    /// Like [`ResponseWriter::new`], but starts from an already-allocated,
    /// cleared message buffer instead of allocating a fresh one.
    pub(crate) fn with_message(message: OwnedMessage) -> ResponseWriter {
        ResponseWriter {
            code: MsgCode::Empty,
            payload: Vec::new(),
            message,
        }
    }

    /// Sets the response code, content format, and payload bytes. Calling
    /// this more than once overwrites the previous call.
    pub fn set_response(&mut self, code: MsgCode, content_format: Option<ContentFormat>, payload: impl Into<Vec<u8>>) {
        self.code = code;
        self.payload = payload.into();
        if let Some(cf) = content_format {
            let _ = self.message.insert_option(crate::option::CONTENT_FORMAT, cf);
        }
    }

    /// Adds an option to the response being built.
    pub fn add_option<T>(&mut self, key: OptionKey<T>, value: T) -> Result<(), Error>
    where
        T: Into<crate::option::OptionValue<'static>>,
    {
        self.message.insert_option(key, value)
    }

    /// Consumes this writer, producing the finished response datagram bytes.
    pub(crate) fn finish(mut self, msg_type: MsgType, msg_id: u16, token: MsgToken) -> Result<OwnedMessage, Error> {
        self.message.set_msg_type(msg_type);
        self.message.set_msg_id(msg_id);
        self.message.set_msg_token(token);
        self.message.set_msg_code(self.code);
        if !self.payload.is_empty() {
            self.message.append_payload_bytes(&self.payload)?;
        }
        Ok(self.message)
    }
}

/// A future-returning request handler.
///
/// Implemented for any `Fn(OwnedMessage, ResponseWriter) -> Fut` so ordinary
/// async closures can be used directly; implement the trait by hand for
/// handlers that need to hold onto extra state.
pub trait Handler: Send + Sync {
    /// Handles one decoded request, producing the filled-in `ResponseWriter`
    /// the driver will encode and send.
    fn handle(&self, request: OwnedMessage, response: ResponseWriter) -> BoxFuture<'static, ResponseWriter>;
}

impl<F, Fut> Handler for F
where
    F: Fn(OwnedMessage, ResponseWriter) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ResponseWriter> + Send + 'static,
{
    fn handle(&self, request: OwnedMessage, response: ResponseWriter) -> BoxFuture<'static, ResponseWriter> {
        Box::pin(self(request, response))
    }
}

/// A handle to a running Observe relationship, returned to the caller that
/// issued the original request.
///
/// Closed once the server de-registers (a response with no Observe option),
/// an error class response arrives, or the caller cancels.
pub struct Observation {
    token: MsgToken,
    registry: Arc<TokenRegistry>,
    receiver: mpsc::Receiver<Result<OwnedMessage, Error>>,
}

impl Observation {
    pub(crate) fn new(
        token: MsgToken,
        registry: Arc<TokenRegistry>,
        receiver: mpsc::Receiver<Result<OwnedMessage, Error>>,
    ) -> Observation {
        Observation { token, registry, receiver }
    }

    /// Waits for the next notification, or returns `Cancelled` if `cancel`
    /// fires first, or `Closed` once the relationship has ended.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Result<OwnedMessage, Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            next = self.receiver.recv() => next.ok_or(Error::Closed)?,
        }
    }

    /// Ends the relationship. Idempotent.
    pub fn cancel(&self) {
        self.registry.cancel(&self.token);
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.registry.cancel(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_format::ContentFormat;

    #[tokio::test]
    async fn closure_handler_builds_a_response() {
        let handler = |_req: OwnedMessage, mut resp: ResponseWriter| async move {
            resp.set_response(MsgCode::SuccessContent, Some(ContentFormat::TEXT_PLAIN_UTF8), b"hi".to_vec());
            resp
        };

        let resp = handler.handle(OwnedMessage::new(), ResponseWriter::new()).await;
        let built = resp.finish(MsgType::Ack, 1, MsgToken::EMPTY).unwrap();
        assert_eq!(built.as_message().payload(), b"hi");
        assert_eq!(built.as_message().msg_code(), MsgCode::SuccessContent);
    }

    #[tokio::test]
    async fn observation_cancel_closes_registry_entry() {
        let registry = Arc::new(TokenRegistry::new(std::time::Duration::from_secs(128)));
        let (tx, rx) = mpsc::channel(1);
        let token = MsgToken::from(1u32);
        registry.register(token, crate::tokens::TokenKind::Observer, tx);

        let observation = Observation::new(token, registry.clone(), rx);
        assert_eq!(registry.len(), 1);
        observation.cancel();
        assert_eq!(registry.len(), 0);
    }
}
