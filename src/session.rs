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

//! The per-remote session driver: a reader task that decodes datagrams and
//! routes them through dedup, retransmit, token, and block-wise state, a
//! writer task that serialises outbound datagrams, and work dispatch that
//! keeps handler invocation off the reader task.
//!
//! The branching in [`Session::handle_datagram`] is grounded in the
//! teacher's `DatagramLocalEndpoint::receive` (request vs. piggybacked
//! response vs. empty message vs. separate response).

use crate::blockwise::{Block1Outcome, BlockwiseEngine, Fingerprint};
use crate::config::Config;
use crate::dedup::{DedupAction, DedupCache};
use crate::error::Error;
use crate::handler::{Handler, Observation, ResponseWriter};
use crate::message::{Message, MsgCode, MsgId, MsgToken, MsgType, OwnedMessage};
use crate::pool::MessagePool;
use crate::retransmit::RetransmitQueue;
use crate::tokens::{DispatchInfo, TokenKind, TokenRegistry};
use crate::transport::Transport;
use crate::worker_pool::WorkerPool;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// One Session per remote endpoint: owns the reliability/correlation state
/// for every exchange with that peer.
pub struct Session {
    transport: Arc<dyn Transport>,
    remote: SocketAddr,
    config: Config,
    dedup: DedupCache,
    retransmit: Arc<RetransmitQueue>,
    tokens: Arc<TokenRegistry>,
    blockwise: BlockwiseEngine,
    worker_pool: Arc<dyn WorkerPool>,
    handler: Option<Arc<dyn Handler>>,
    message_pool: MessagePool,
    /// Bounds concurrently in-flight Confirmable exchanges to this peer to
    /// `TransParams::nstart`, per RFC7252 §4.7.
    nstart_permits: Arc<Semaphore>,
    next_msg_id: AtomicU16,
    error_sink: Arc<dyn Fn(Error) + Send + Sync>,
    cancel: CancellationToken,
    writer_tx: mpsc::Sender<Vec<u8>>,
}

fn default_error_sink(err: Error) {
    log::warn!("Session error: {:?}", err);
}

/// Single pass over a request's option block: rejects an unrecognized
/// critical option with `InvalidOption` (RFC7252 §5.4.1) and, for every
/// option that survives, folds it into the Block1/Block2 cache key unless
/// it is marked NoCacheKey (§5.4.2).
fn scan_options(message: &Message<'_>) -> Result<Vec<u8>, Error> {
    let mut key = Vec::new();
    for option in message.options() {
        let (number, value) = option?;
        if number.static_name().is_none() && number.is_critical() {
            return Err(Error::InvalidOption);
        }
        if !number.is_no_cache_key() {
            key.extend_from_slice(&number.0.to_be_bytes());
            key.extend_from_slice(&(value.len() as u32).to_be_bytes());
            key.extend_from_slice(value);
        }
    }
    Ok(key)
}

impl Session {
    /// Creates a new session for `remote`, communicating over `transport`.
    /// `handler` serves inbound requests; sessions used only for outbound
    /// client requests may pass `None`.
    pub fn new(
        transport: Arc<dyn Transport>,
        remote: SocketAddr,
        config: Config,
        worker_pool: Arc<dyn WorkerPool>,
        handler: Option<Arc<dyn Handler>>,
    ) -> (Arc<Session>, mpsc::Receiver<Vec<u8>>) {
        let (writer_tx, writer_rx) = mpsc::channel(64);
        let session = Arc::new(Session {
            dedup: DedupCache::new(&config.transmission),
            retransmit: Arc::new(RetransmitQueue::new(config.transmission)),
            tokens: Arc::new(TokenRegistry::new(config.observer_freshness_window)),
            blockwise: BlockwiseEngine::new(config.blockwise.transfer_timeout, config.max_message_size),
            message_pool: MessagePool::new(),
            nstart_permits: Arc::new(Semaphore::new(config.transmission.nstart as usize)),
            transport,
            remote,
            config,
            worker_pool,
            handler,
            next_msg_id: AtomicU16::new(0),
            error_sink: Arc::new(default_error_sink),
            cancel: CancellationToken::new(),
            writer_tx,
        });
        (session, writer_rx)
    }

    /// Overrides the default `log::warn!`-based error sink.
    pub fn set_error_sink(&mut self, sink: Arc<dyn Fn(Error) + Send + Sync>) {
        self.error_sink = sink;
    }

    fn next_msg_id(&self) -> MsgId {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawns the reader and writer tasks, returning when both have exited
    /// (normally only on cancellation).
    pub async fn run(self: Arc<Self>, writer_rx: mpsc::Receiver<Vec<u8>>) {
        let reader = tokio::spawn(self.clone().reader_loop());
        let writer = tokio::spawn(self.clone().writer_loop(writer_rx));
        let sweeper = tokio::spawn(self.clone().sweep_loop());
        let _ = tokio::join!(reader, writer, sweeper);
    }

    /// Periodically reaps expired block-wise transfer state, at
    /// `Config::heart_beat` granularity.
    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heart_beat);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => self.blockwise.sweep_expired(),
            }
        }
    }

    async fn writer_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                datagram = rx.recv() => {
                    match datagram {
                        Some(datagram) => {
                            if let Err(e) = self.transport.send_to(&datagram, self.remote).await {
                                (self.error_sink)(e);
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn reader_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; self.config.max_message_size];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.transport.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _from)) => {
                            let datagram = buf[..len].to_vec();
                            self.clone().handle_datagram(datagram).await;
                        }
                        Err(e) => {
                            (self.error_sink)(e);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn enqueue(&self, datagram: Vec<u8>) {
        if self.writer_tx.send(datagram).await.is_err() {
            log::warn!("Session writer channel closed while enqueuing a datagram");
        }
    }

    /// Routes one decoded-or-not datagram: decode failures are logged and
    /// dropped (no reply), matching the documented decode-error policy.
    async fn handle_datagram(self: Arc<Self>, datagram: Vec<u8>) {
        let message = match Message::decode(&datagram) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("Dropping undecodable datagram from {}: {:?}", self.remote, e);
                return;
            }
        };

        log::debug!("INBOUND: {} {}", self.remote, message);

        if message.msg_code().is_method() {
            self.handle_request(message).await;
        } else if message.msg_code().is_empty() && message.msg_type().is_con() {
            // Empty CON: a ping. Reset it.
            self.send_empty(MsgType::Rst, message.msg_id()).await;
        } else if !message.msg_code().is_empty() || message.msg_type().is_ack() || message.msg_type().is_rst() {
            self.handle_response(message).await;
        } else {
            log::debug!("Unroutable message from {}: {}", self.remote, message);
        }
    }

    async fn send_empty(&self, msg_type: MsgType, msg_id: MsgId) {
        let mut owned = OwnedMessage::new();
        owned.set_msg_type(msg_type);
        owned.set_msg_id(msg_id);
        owned.set_msg_code(MsgCode::Empty);
        self.enqueue(owned.as_bytes().to_vec()).await;
    }

    /// Checks out a response builder backed by a pooled buffer instead of a
    /// fresh allocation.
    fn response_writer(&self) -> ResponseWriter {
        ResponseWriter::with_message(self.message_pool.acquire().take())
    }

    async fn handle_request(self: Arc<Self>, message: Message<'_>) {
        let is_con = message.msg_type().is_con();
        let msg_id = message.msg_id();
        let token = message.msg_token();

        if is_con {
            match self.dedup.check(self.remote, msg_id) {
                DedupAction::Resend(response) => {
                    self.enqueue(response).await;
                    return;
                }
                DedupAction::Suppress => return,
                DedupAction::Dispatch => {}
            }
        }

        let cache_key = match scan_options(&message) {
            Ok(key) => key,
            Err(e) => {
                self.respond_with_error(e, is_con, msg_id, token).await;
                return;
            }
        };

        let block1 = match message.block1() {
            Ok(block) => block,
            Err(e) => {
                self.respond_with_error(e, is_con, msg_id, token).await;
                return;
            }
        };
        if block1.is_some() && !self.config.blockwise.enable {
            self.respond_with_error(Error::InvalidOption, is_con, msg_id, token).await;
            return;
        }

        let body = match block1 {
            Some(block) => {
                let fp = Fingerprint {
                    remote: self.remote,
                    token,
                    method: message.msg_code(),
                    cache_key: cache_key.clone(),
                };
                match self.blockwise.offer_block1(fp, block, message.payload()) {
                    Ok(Block1Outcome::Continue(echo)) => {
                        let mut resp = self.response_writer();
                        resp.set_response(MsgCode::SuccessContinue, None, Vec::new());
                        let _ = resp.add_option(crate::option::BLOCK1, echo);
                        self.finish_and_send(resp, is_con, msg_id, token).await;
                        return;
                    }
                    Ok(Block1Outcome::Complete(full)) => full,
                    Err(e) => {
                        self.respond_with_error(e, is_con, msg_id, token).await;
                        return;
                    }
                }
            }
            None => message.payload().to_vec(),
        };

        let block2_requested = match message.block2() {
            Ok(block) => block,
            Err(e) => {
                self.respond_with_error(e, is_con, msg_id, token).await;
                return;
            }
        };
        if block2_requested.is_some() && !self.config.blockwise.enable {
            self.respond_with_error(Error::InvalidOption, is_con, msg_id, token).await;
            return;
        }

        let fp = Fingerprint {
            remote: self.remote,
            token,
            method: message.msg_code(),
            cache_key,
        };

        if let Some(requested) = block2_requested {
            if requested.num() > 0 {
                if let Some((chunk, info, code, content_format)) = self.blockwise.block2_slice(&fp, requested) {
                    let mut resp = self.response_writer();
                    resp.set_response(code, content_format, chunk);
                    let _ = resp.add_option(crate::option::BLOCK2, info);
                    self.finish_and_send(resp, is_con, msg_id, token).await;
                    return;
                }
            }
        }

        let handler = match &self.handler {
            Some(h) => h.clone(),
            None => return,
        };

        let mut owned_request = message.to_owned_message();
        if owned_request.set_payload(&body).is_err() {
            (self.error_sink)(Error::RequestEntityTooLarge);
            return;
        }

        let session = self.clone();
        let requested_szx = block2_requested.map(|b| b.szx());
        let accepted = self.worker_pool.submit(Box::pin(async move {
            let response = handler.handle(owned_request, session.response_writer()).await;
            session
                .send_handler_response(response, is_con, msg_id, token, fp, requested_szx)
                .await;
        }));

        if !accepted {
            (self.error_sink)(Error::Overloaded);
        }
    }

    async fn respond_with_error(&self, error: Error, is_con: bool, msg_id: MsgId, token: MsgToken) {
        let code = match error {
            Error::RequestEntityIncomplete => MsgCode::ClientErrorRequestEntityIncomplete,
            Error::RequestEntityTooLarge => MsgCode::ClientErrorRequestEntityTooLarge,
            _ => MsgCode::ClientErrorBadOption,
        };
        let mut resp = self.response_writer();
        resp.set_response(code, None, Vec::new());
        self.finish_and_send(resp, is_con, msg_id, token).await;
    }

    async fn finish_and_send(&self, response: ResponseWriter, is_con: bool, msg_id: MsgId, token: MsgToken) {
        let msg_type = if is_con { MsgType::Ack } else { MsgType::Non };
        match response.finish(msg_type, msg_id, token) {
            Ok(owned) => self.deliver(owned, is_con, msg_id).await,
            Err(e) => (self.error_sink)(e),
        }
    }

    /// Finishes a handler-produced response, slicing it into a Block2 series
    /// (cached under `fp` for content stability) when block-wise transfers
    /// are enabled and the payload doesn't fit in one datagram.
    async fn send_handler_response(
        &self,
        response: ResponseWriter,
        is_con: bool,
        msg_id: MsgId,
        token: MsgToken,
        fp: Fingerprint,
        requested_szx: Option<u8>,
    ) {
        let msg_type = if is_con { MsgType::Ack } else { MsgType::Non };
        let built = match response.finish(msg_type, msg_id, token) {
            Ok(owned) => owned,
            Err(e) => {
                (self.error_sink)(e);
                return;
            }
        };

        let szx = requested_szx.unwrap_or(self.config.blockwise.szx);
        let block_len = 1usize << (szx as usize + 4);
        let payload_len = built.as_message().payload().len();

        if !self.config.blockwise.enable || payload_len <= block_len {
            self.deliver(built, is_con, msg_id).await;
            return;
        }

        let code = built.as_message().msg_code();
        let content_format = built.as_message().content_format().unwrap_or(None);
        let payload = built.as_message().payload().to_vec();
        self.message_pool.release(built);

        let (chunk, info) = self.blockwise.start_block2(fp, payload, code, content_format, szx);
        let mut resp = self.response_writer();
        resp.set_response(code, content_format, chunk);
        let _ = resp.add_option(crate::option::BLOCK2, info);
        self.finish_and_send(resp, is_con, msg_id, token).await;
    }

    /// Records the response for dedup (Confirmable requests only), enqueues
    /// it for sending, and returns the buffer to the message pool.
    async fn deliver(&self, owned: OwnedMessage, is_con: bool, msg_id: MsgId) {
        let bytes = owned.as_bytes().to_vec();
        if is_con {
            self.dedup.record_response(self.remote, msg_id, bytes.clone());
        }
        self.enqueue(bytes).await;
        self.message_pool.release(owned);
    }

    async fn handle_response(&self, message: Message<'_>) {
        let msg_id = message.msg_id();
        let msg_type = message.msg_type();
        let token = message.msg_token();

        if msg_type.is_ack() || msg_type.is_rst() {
            self.retransmit.acknowledge(msg_id, self.remote);
        }

        if message.msg_code().is_empty() {
            // Bare ACK/RST: silences retransmission only, nothing to correlate yet.
            return;
        }

        let info = DispatchInfo {
            is_error_class: message.msg_code().is_error(),
            observe_seq: message.observe().unwrap_or(None),
        };
        let owned = message.to_owned_message();
        let (consumed, _keep_registered) = self.tokens.dispatch(&token, &info, owned);
        if !consumed {
            log::debug!("No registered handler for token {:?} from {}", token, self.remote);
        }

        if msg_type.is_con() {
            let reply_type = if consumed { MsgType::Ack } else { MsgType::Rst };
            self.send_empty(reply_type, msg_id).await;
        }
    }

    /// Sends a Confirmable request and registers it with the retransmit
    /// queue and token registry, returning a receiver for the eventual
    /// terminal result (for `OneShot`) and a cancellation token covering
    /// the whole exchange.
    ///
    /// Spawns the retransmit timer loop for this exchange; a run that
    /// exhausts `max_retransmit` cancels the token registration and
    /// delivers `TransmitTimeout` to the caller.
    pub async fn send_request(
        self: &Arc<Self>,
        mut request: OwnedMessage,
        kind: TokenKind,
    ) -> (mpsc::Receiver<Result<OwnedMessage, Error>>, CancellationToken) {
        // NSTART (RFC7252 §4.7): block until a slot frees up rather than
        // exceeding the configured number of concurrent Confirmable
        // exchanges with this peer. The permit is held by the spawned
        // retransmit task and releases once the exchange concludes.
        let permit = self
            .nstart_permits
            .clone()
            .acquire_owned()
            .await
            .expect("nstart semaphore is never closed");

        let msg_id = self.next_msg_id();
        request.set_msg_id(msg_id);
        request.set_msg_type(MsgType::Con);
        let token = request.msg_token();

        let (tx, rx) = mpsc::channel(8);
        let timeout_tx = tx.clone();
        self.tokens.register(token, kind, tx);

        let datagram = request.as_bytes().to_vec();
        let cancel = self.retransmit.register(msg_id, self.remote, datagram.clone());
        self.enqueue(datagram).await;

        let session = self.clone();
        let retransmit_cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let resender = session.clone();
            let result = session
                .retransmit
                .run_one(msg_id, retransmit_cancel, move |_remote, datagram| {
                    let resender = resender.clone();
                    async move {
                        resender.enqueue(datagram).await;
                        Ok(())
                    }
                })
                .await;
            if result == Err(Error::TransmitTimeout) {
                session.tokens.cancel(&token);
                let _ = timeout_tx.send(Err(Error::TransmitTimeout)).await;
            }
        });

        (rx, cancel)
    }

    /// Issues a request whose registration is `Observer`, returning an
    /// [`Observation`] handle instead of a raw channel.
    pub async fn observe(self: &Arc<Self>, request: OwnedMessage) -> Observation {
        let token = request.msg_token();
        let (rx, _cancel) = self.send_request(request, TokenKind::Observer).await;
        Observation::new(token, self.tokens.clone(), rx)
    }

    /// Sends an empty Confirmable ping and waits for it to be acknowledged
    /// (or reset), retrying per the transmission parameters. Used by the
    /// acceptor's keepalive companion task to detect a dead peer.
    pub async fn ping(self: &Arc<Self>) -> Result<(), Error> {
        let _permit = self
            .nstart_permits
            .clone()
            .acquire_owned()
            .await
            .expect("nstart semaphore is never closed");

        let msg_id = self.next_msg_id();
        let mut ping = OwnedMessage::new();
        ping.set_msg_type(MsgType::Con);
        ping.set_msg_id(msg_id);
        ping.set_msg_code(MsgCode::Empty);

        let datagram = ping.as_bytes().to_vec();
        let cancel = self.retransmit.register(msg_id, self.remote, datagram.clone());
        self.enqueue(datagram).await;

        let session = self.clone();
        let result = self
            .retransmit
            .run_one(msg_id, cancel, move |_remote, datagram| {
                let session = session.clone();
                async move {
                    session.enqueue(datagram).await;
                    Ok(())
                }
            })
            .await;

        // `run_one` reports an acknowledged exchange as `Cancelled` (its own
        // cancellation token fires from `RetransmitQueue::acknowledge`); only
        // `TransmitTimeout` means the peer never answered.
        match result {
            Err(Error::TransmitTimeout) => Err(Error::TransmitTimeout),
            _ => Ok(()),
        }
    }

    /// Runs the full shutdown sequence: stop accepting new work, fail all
    /// pending exchanges and registered handlers with `Cancelled`, then
    /// stop the reader/writer tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.retransmit.cancel_all();
        self.tokens.cancel_all();
    }

    /// The remote endpoint this session communicates with.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// This session's cancellation token, for composing external shutdown
    /// triggers (e.g. from a server acceptor).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_format::ContentFormat;
    use crate::transport::LoopbackTransport;
    use crate::worker_pool::TokioWorkerPool;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn echo_handler() -> Arc<dyn Handler> {
        Arc::new(|req: OwnedMessage, mut resp: ResponseWriter| async move {
            let payload = req.as_message().payload().to_vec();
            resp.set_response(MsgCode::SuccessContent, Some(ContentFormat::TEXT_PLAIN_UTF8), payload);
            resp
        })
    }

    #[tokio::test]
    async fn request_response_round_trip_over_loopback() {
        let (client_transport, server_transport) = LoopbackTransport::new_pair(addr(1), addr(2));

        let worker_pool: Arc<dyn WorkerPool> = Arc::new(TokioWorkerPool::new(4));
        let (server, server_rx) = Session::new(
            Arc::new(server_transport),
            addr(1),
            Config::default(),
            worker_pool.clone(),
            Some(echo_handler()),
        );
        tokio::spawn(server.clone().run(server_rx));

        let (client, client_rx) = Session::new(
            Arc::new(client_transport),
            addr(2),
            Config::default(),
            worker_pool,
            None,
        );
        tokio::spawn(client.clone().run(client_rx));

        let mut request = OwnedMessage::new();
        request.set_msg_code(MsgCode::MethodGet);
        request.set_msg_token(MsgToken::from(0xAAu32));
        request.append_payload_bytes(b"ping").unwrap();

        let (mut rx, _cancel) = client.send_request(request, TokenKind::OneShot).await;

        let response = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("response arrived before timeout")
            .expect("channel open")
            .expect("no error");

        assert_eq!(response.as_message().msg_code(), MsgCode::SuccessContent);
        assert_eq!(response.as_message().payload(), b"ping");

        client.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn empty_con_ping_is_reset() {
        let (client_transport, server_transport) = LoopbackTransport::new_pair(addr(3), addr(4));
        let worker_pool: Arc<dyn WorkerPool> = Arc::new(TokioWorkerPool::new(4));

        let (server, server_rx) = Session::new(Arc::new(server_transport), addr(3), Config::default(), worker_pool.clone(), None);
        tokio::spawn(server.clone().run(server_rx));

        let mut ping = OwnedMessage::new();
        ping.set_msg_type(MsgType::Con);
        ping.set_msg_code(MsgCode::Empty);
        ping.set_msg_id(42);

        let injector = client_transport.injector();
        // Deliver the ping as if it arrived at the server's transport.
        drop(client_transport);
        injector.send((ping.as_bytes().to_vec(), addr(4))).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server.shutdown();
    }
}
