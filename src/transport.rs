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

//! The datagram transport seam: a small trait standing in for a bound UDP
//! socket, so the session driver can run against a real `tokio::net::UdpSocket`
//! or an in-process loopback during tests.

use crate::error::Error;
use futures::future::BoxFuture;
use std::net::SocketAddr;

/// A bound datagram socket, or anything that behaves like one.
///
/// Unlike the underlying `tokio::net::UdpSocket`, this trait is object-safe:
/// the session driver holds its transport as a `Arc<dyn Transport>` so it can
/// be swapped out for a loopback double in tests without generic parameters
/// propagating through the whole driver.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Sends `buf` as a single datagram to `dest`.
    fn send_to<'a>(&'a self, buf: &'a [u8], dest: SocketAddr) -> BoxFuture<'a, Result<usize, Error>>;

    /// Receives a single datagram into `buf`, returning its length and sender.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<(usize, SocketAddr), Error>>;

    /// The address this transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr, Error>;
}

impl Transport for tokio::net::UdpSocket {
    fn send_to<'a>(&'a self, buf: &'a [u8], dest: SocketAddr) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move { Ok(tokio::net::UdpSocket::send_to(self, buf, dest).await?) })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<(usize, SocketAddr), Error>> {
        Box::pin(async move { Ok(tokio::net::UdpSocket::recv_from(self, buf).await?) })
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(tokio::net::UdpSocket::local_addr(self)?)
    }
}

/// An in-process transport that loops datagrams back to whoever sent them,
/// for exercising the session driver without a real socket.
#[derive(Debug)]
pub struct LoopbackTransport {
    local: SocketAddr,
    sender: tokio::sync::mpsc::Sender<(Vec<u8>, SocketAddr)>,
    receiver: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
}

impl LoopbackTransport {
    /// Creates a new loopback transport bound to the given nominal local address.
    pub fn new(local: SocketAddr) -> LoopbackTransport {
        let (sender, receiver) = tokio::sync::mpsc::channel(64);
        LoopbackTransport {
            local,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    /// A sender handle that, when used, delivers directly into this transport's
    /// `recv_from` queue — used by tests to inject inbound datagrams.
    pub fn injector(&self) -> tokio::sync::mpsc::Sender<(Vec<u8>, SocketAddr)> {
        self.sender.clone()
    }

    /// Creates two transports cross-wired so that `a`'s sends are `b`'s
    /// receives and vice versa, for driving a pair of `Session`s against
    /// each other in tests.
    pub fn new_pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (LoopbackTransport, LoopbackTransport) {
        let (tx_ab, rx_ab) = tokio::sync::mpsc::channel(64);
        let (tx_ba, rx_ba) = tokio::sync::mpsc::channel(64);
        let a = LoopbackTransport {
            local: addr_a,
            sender: tx_ab,
            receiver: tokio::sync::Mutex::new(rx_ba),
        };
        let b = LoopbackTransport {
            local: addr_b,
            sender: tx_ba,
            receiver: tokio::sync::Mutex::new(rx_ab),
        };
        (a, b)
    }
}

impl Transport for LoopbackTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], dest: SocketAddr) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            self.sender
                .send((buf.to_vec(), dest))
                .await
                .map_err(|_| Error::Closed)?;
            Ok(buf.len())
        })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<(usize, SocketAddr), Error>> {
        Box::pin(async move {
            let mut receiver = self.receiver.lock().await;
            match receiver.recv().await {
                Some((packet, addr)) => {
                    if packet.len() > buf.len() {
                        return Err(Error::MessageTooLarge);
                    }
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok((packet.len(), addr))
                }
                None => Err(Error::Closed),
            }
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_send_then_recv() {
        let transport = LoopbackTransport::new("127.0.0.1:5683".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        transport.send_to(b"hello", peer).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, peer);
    }

    #[tokio::test]
    async fn injector_delivers_inbound_datagrams() {
        let transport = LoopbackTransport::new("127.0.0.1:5683".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let injector = transport.injector();

        injector.send((b"ping".to_vec(), peer)).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, peer);
    }
}
