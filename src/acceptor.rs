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

//! The server side: a [`Listener`] demultiplexes inbound datagrams by
//! source address into per-remote [`Transport`]s, and an [`Acceptor`]
//! turns each into a running [`Session`].

use crate::config::Config;
use crate::error::Error;
use crate::handler::Handler;
use crate::session::Session;
use crate::transport::Transport;
use crate::worker_pool::WorkerPool;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One accepted connection: a transport scoped to a single remote address.
pub struct Accepted {
    pub transport: Arc<dyn Transport>,
    pub remote: SocketAddr,
}

/// Something that can hand out per-remote transports as datagrams arrive
/// from addresses not seen before.
pub trait Listener: Send + Sync {
    /// Waits for the next new remote, or `cancel` firing, whichever comes first.
    fn accept<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Accepted, Error>>;

    /// Releases the underlying socket/resources. Idempotent.
    fn close(&self);
}

/// A [`Listener`] backed by one bound UDP socket, demultiplexing by source
/// address into per-remote channel-backed transports.
pub struct UdpListener {
    socket: Arc<tokio::net::UdpSocket>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    closed: CancellationToken,
}

struct DemuxedTransport {
    socket: Arc<tokio::net::UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl std::fmt::Debug for DemuxedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemuxedTransport").field("remote", &self.remote).finish()
    }
}

impl Transport for DemuxedTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], dest: SocketAddr) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { Ok(self.socket.send_to(buf, dest).await?) })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<(usize, SocketAddr), Error>> {
        Box::pin(async move {
            let mut receiver = self.receiver.lock().await;
            match receiver.recv().await {
                Some(packet) => {
                    if packet.len() > buf.len() {
                        return Err(Error::MessageTooLarge);
                    }
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok((packet.len(), self.remote))
                }
                None => Err(Error::Closed),
            }
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.local)
    }
}

impl UdpListener {
    /// Binds a UDP socket at `addr` and starts the background demux task.
    pub async fn bind(addr: SocketAddr) -> Result<UdpListener, Error> {
        let socket = Arc::new(tokio::net::UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();

        tokio::spawn(demux_loop(socket.clone(), local, accept_tx, closed.clone()));

        Ok(UdpListener {
            socket,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed,
        })
    }
}

async fn demux_loop(
    socket: Arc<tokio::net::UdpSocket>,
    local: SocketAddr,
    accept_tx: mpsc::Sender<Accepted>,
    closed: CancellationToken,
) {
    let mut routes: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, remote) = tokio::select! {
            _ = closed.cancelled() => return,
            result = socket.recv_from(&mut buf) => match result {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("UdpListener: recv_from failed: {}", e);
                    continue;
                }
            },
        };

        let datagram = buf[..len].to_vec();

        if let Some(sender) = routes.get(&remote) {
            if sender.try_send(datagram).is_err() {
                log::warn!("UdpListener: dropping datagram from {}: route backed up or closed", remote);
                routes.remove(&remote);
            }
            continue;
        }

        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(DemuxedTransport {
            socket: socket.clone(),
            local,
            remote,
            receiver: tokio::sync::Mutex::new(rx),
        });

        if tx.try_send(datagram).is_err() {
            log::warn!("UdpListener: dropping first datagram from {}: route channel full", remote);
            continue;
        }
        routes.insert(remote, tx);

        if accept_tx.send(Accepted { transport, remote }).await.is_err() {
            return;
        }
    }
}

impl Listener for UdpListener {
    fn accept<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Accepted, Error>> {
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                next = async { self.accept_rx.lock().await.recv().await } => next.ok_or(Error::Closed),
            }
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// An in-process [`Listener`] for driving an [`Acceptor`] in tests, paired
/// with [`crate::transport::LoopbackTransport`].
pub struct LoopbackListener {
    queue: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    injector: mpsc::Sender<Accepted>,
}

impl LoopbackListener {
    pub fn new() -> LoopbackListener {
        let (injector, queue) = mpsc::channel(16);
        LoopbackListener {
            queue: tokio::sync::Mutex::new(queue),
            injector,
        }
    }

    /// A sender handle tests use to hand the listener a freshly "accepted"
    /// connection.
    pub fn injector(&self) -> mpsc::Sender<Accepted> {
        self.injector.clone()
    }
}

impl Default for LoopbackListener {
    fn default() -> Self {
        LoopbackListener::new()
    }
}

impl Listener for LoopbackListener {
    fn accept<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<Accepted, Error>> {
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                next = async { self.queue.lock().await.recv().await } => next.ok_or(Error::Closed),
            }
        })
    }

    fn close(&self) {}
}

/// Accepts connections from a [`Listener`], running one [`Session`] per
/// remote and an optional keepalive companion task.
pub struct Acceptor {
    listener: Arc<dyn Listener>,
    config: Config,
    worker_pool: Arc<dyn WorkerPool>,
    handler: Arc<dyn Handler>,
    cancel: CancellationToken,
    sessions: std::sync::Mutex<Vec<Arc<Session>>>,
}

impl Acceptor {
    pub fn new(
        listener: Arc<dyn Listener>,
        config: Config,
        worker_pool: Arc<dyn WorkerPool>,
        handler: Arc<dyn Handler>,
    ) -> Arc<Acceptor> {
        Arc::new(Acceptor {
            listener,
            config,
            worker_pool,
            handler,
            cancel: CancellationToken::new(),
            sessions: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Recovering from mutex poisoning in Acceptor");
                poisoned.into_inner()
            }
        }
    }

    /// Signals shutdown: stops accepting new connections. `run` then waits
    /// for every outstanding session worker to terminate before returning.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accepts connections until shutdown, running each to completion.
    pub async fn run(self: Arc<Self>) {
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.listener.accept(&self.cancel) => result,
            };

            let accepted = match accepted {
                Ok(accepted) => accepted,
                Err(Error::Cancelled) => break,
                Err(e) => {
                    log::warn!("Acceptor: listener error: {:?}", e);
                    continue;
                }
            };

            let (session, writer_rx) = Session::new(
                accepted.transport,
                accepted.remote,
                self.config,
                self.worker_pool.clone(),
                Some(self.handler.clone()),
            );
            self.lock_sessions().push(session.clone());

            let run_session = session.clone();
            tasks.spawn(async move { run_session.run(writer_rx).await });

            if let Some(interval) = self.config.keepalive.interval {
                let keepalive_session = session.clone();
                let max_retries = self.config.keepalive.max_retries;
                tasks.spawn(async move { keepalive_loop(keepalive_session, interval, max_retries).await });
            }
        }

        for session in self.lock_sessions().drain(..) {
            session.shutdown();
        }

        self.listener.close();

        while tasks.join_next().await.is_some() {}
    }
}

async fn keepalive_loop(session: Arc<Session>, interval: Duration, max_retries: u32) {
    let cancel = session.cancellation_token();
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match session.ping().await {
            Ok(()) => consecutive_failures = 0,
            Err(_) => {
                consecutive_failures += 1;
                if consecutive_failures >= max_retries {
                    log::warn!("Session to {} unreachable after {} keepalive probes, closing", session.remote(), max_retries);
                    session.shutdown();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_format::ContentFormat;
    use crate::handler::ResponseWriter;
    use crate::message::{MsgCode, MsgToken, MsgType, OwnedMessage};
    use crate::tokens::TokenKind;
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
    async fn accepted_connection_is_served_by_a_session() {
        let (client_transport, server_transport) = LoopbackTransport::new_pair(addr(10), addr(11));

        let listener = Arc::new(LoopbackListener::new());
        let worker_pool: Arc<dyn WorkerPool> = Arc::new(TokioWorkerPool::new(4));
        let acceptor = Acceptor::new(listener.clone(), Config::default(), worker_pool.clone(), echo_handler());

        listener
            .injector()
            .send(Accepted { transport: Arc::new(server_transport), remote: addr(10) })
            .await
            .unwrap();

        let running = tokio::spawn(acceptor.clone().run());

        let (client, client_rx) = Session::new(Arc::new(client_transport), addr(11), Config::default(), worker_pool, None);
        tokio::spawn(client.clone().run(client_rx));

        let mut request = OwnedMessage::new();
        request.set_msg_type(MsgType::Con);
        request.set_msg_code(MsgCode::MethodGet);
        request.set_msg_token(MsgToken::from(0x77u32));
        request.append_payload_bytes(b"hi").unwrap();

        let (mut rx, _cancel) = client.send_request(request, TokenKind::OneShot).await;
        let response = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("response arrived before timeout")
            .expect("channel open")
            .expect("no error");

        assert_eq!(response.as_message().payload(), b"hi");

        acceptor.shutdown();
        client.shutdown();
        running.await.unwrap();
    }
}
