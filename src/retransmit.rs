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

//! Retransmission of outbound Confirmable messages: one timer per pending
//! exchange, exponential backoff with jitter, cancellation on a matching
//! ACK or RST.

use crate::error::Error;
use crate::message::MsgId;
use crate::trans_params::TransParams;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// One outbound Confirmable awaiting acknowledgement.
///
/// The queue is the primary owner of this state; the token registry only
/// ever holds a lookup key (`message_id`) back into the queue, never a
/// second reference to the exchange itself.
#[derive(Debug)]
struct PendingExchange {
    remote: SocketAddr,
    datagram: Vec<u8>,
    attempt: u32,
    sent_at: Instant,
    cancel: CancellationToken,
}

/// Per-session table of in-flight Confirmable exchanges.
///
/// Owns no tasks itself: [`RetransmitQueue::run_one`] drives a single
/// exchange's timer loop and is spawned by the session driver per
/// Confirmable send.
#[derive(Debug)]
pub struct RetransmitQueue {
    params: TransParams,
    pending: std::sync::Mutex<HashMap<MsgId, PendingExchange>>,
}

impl RetransmitQueue {
    /// Creates an empty queue using the given transmission parameters.
    pub fn new(params: TransParams) -> RetransmitQueue {
        RetransmitQueue {
            params,
            pending: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MsgId, PendingExchange>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Recovering from mutex poisoning in RetransmitQueue");
                poisoned.into_inner()
            }
        }
    }

    /// Registers `datagram` (already encoded, Confirmable) as pending under
    /// `message_id`, returning the per-exchange cancellation token the
    /// caller should hold alongside the send.
    pub fn register(&self, message_id: MsgId, remote: SocketAddr, datagram: Vec<u8>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let exchange = PendingExchange {
            remote,
            datagram,
            attempt: 0,
            sent_at: Instant::now(),
            cancel: cancel.clone(),
        };
        self.lock().insert(message_id, exchange);
        cancel
    }

    /// Called on receipt of an ACK or RST with a matching `message_id` and
    /// remote. Cancels the timer and removes the entry. Returns `true` if
    /// an entry was actually present (i.e. this ack/reset was expected).
    pub fn acknowledge(&self, message_id: MsgId, remote: SocketAddr) -> bool {
        let mut pending = self.lock();
        if let Some(exchange) = pending.get(&message_id) {
            if exchange.remote != remote {
                return false;
            }
        } else {
            return false;
        }
        let exchange = pending.remove(&message_id).expect("checked above");
        exchange.cancel.cancel();
        true
    }

    /// Fails every pending exchange with `Cancelled`, for session shutdown.
    pub fn cancel_all(&self) {
        for (_, exchange) in self.lock().drain() {
            exchange.cancel.cancel();
        }
    }

    /// Number of exchanges currently in flight. Exposed for tests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drives the retransmit timer loop for one pending exchange, resending
    /// through `send` on each expiry until it is acknowledged, cancelled, or
    /// `MAX_RETRANSMIT` is exhausted.
    ///
    /// The session driver spawns this once per Confirmable send; it returns
    /// once the exchange reaches a terminal state.
    pub async fn run_one<F, Fut>(&self, message_id: MsgId, cancel: CancellationToken, mut send: F) -> Result<(), Error>
    where
        F: FnMut(SocketAddr, Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
    {
        loop {
            let (remote, datagram, attempt, sent_at) = {
                let pending = self.lock();
                match pending.get(&message_id) {
                    Some(exchange) => (exchange.remote, exchange.datagram.clone(), exchange.attempt, exchange.sent_at),
                    None => return Ok(()),
                }
            };

            if attempt > 0 {
                send(remote, datagram).await?;
            }

            if attempt >= self.params.max_retransmit {
                // The final retransmission has gone out; a straggling ACK can
                // still arrive until MAX_TRANSMIT_WAIT elapses since the
                // first send (RFC7252 §4.8.2), so wait out the remainder
                // instead of declaring the exchange dead right away.
                let remaining = self.params.max_transmit_wait().saturating_sub(sent_at.elapsed());
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(remaining) => {}
                }
                self.lock().remove(&message_id);
                return Err(Error::TransmitTimeout);
            }

            let delay = self.params.calc_retransmit_duration(attempt + 1);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {
                    let mut pending = self.lock();
                    if let Some(exchange) = pending.get_mut(&message_id) {
                        exchange.attempt += 1;
                    } else {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn remote() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[tokio::test]
    async fn acknowledge_cancels_pending_exchange() {
        let queue = RetransmitQueue::new(TransParams::default());
        let cancel = queue.register(7, remote(), vec![1, 2, 3]);
        assert_eq!(queue.len(), 1);

        assert!(queue.acknowledge(7, remote()));
        assert!(cancel.is_cancelled());
        assert_eq!(queue.len(), 0);

        // Idempotent: acknowledging again finds nothing.
        assert!(!queue.acknowledge(7, remote()));
    }

    #[tokio::test]
    async fn acknowledge_ignores_wrong_remote() {
        let queue = RetransmitQueue::new(TransParams::default());
        queue.register(7, remote(), vec![1, 2, 3]);
        let other: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert!(!queue.acknowledge(7, other));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_fails_every_exchange() {
        let queue = RetransmitQueue::new(TransParams::default());
        let c1 = queue.register(1, remote(), vec![]);
        let c2 = queue.register(2, remote(), vec![]);
        queue.cancel_all();
        assert!(c1.is_cancelled());
        assert!(c2.is_cancelled());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_one_times_out_after_max_retransmit() {
        let mut params = TransParams::default();
        params.ack_timeout = std::time::Duration::from_millis(1);
        params.max_retransmit = 2;
        let queue = RetransmitQueue::new(params);
        let cancel = queue.register(1, remote(), vec![0xAA]);

        let sends = Arc::new(AtomicUsize::new(0));
        let sends2 = sends.clone();

        let result = queue
            .run_one(1, cancel, move |_remote, _datagram| {
                sends2.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(Error::TransmitTimeout));
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_one_stops_when_acknowledged_mid_wait() {
        let mut params = TransParams::default();
        params.ack_timeout = std::time::Duration::from_secs(10);
        let queue = Arc::new(RetransmitQueue::new(params));
        let cancel = queue.register(1, remote(), vec![0xAA]);

        let queue2 = queue.clone();
        let handle = tokio::spawn(async move {
            queue2.run_one(1, cancel, |_r, _d| async { Ok(()) }).await
        });

        tokio::task::yield_now().await;
        assert!(queue.acknowledge(1, remote()));

        assert_eq!(handle.await.unwrap(), Err(Error::Cancelled));
    }
}
