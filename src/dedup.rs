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

//! Deduplication of recently-seen Confirmable messages, keyed by
//! `(remote, message_id)` with `EXCHANGE_LIFETIME`-based eviction.

use crate::message::MsgId;
use crate::trans_params::TransParams;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// What happened the first time a `(remote, message_id)` pair was seen.
#[derive(Debug, Clone)]
enum Entry {
    /// Seen, handler dispatched, response not yet produced.
    Pending,
    /// Seen, handler already produced this response datagram.
    Answered(Vec<u8>),
}

#[derive(Debug)]
struct Slot {
    entry: Entry,
    inserted_at: Instant,
}

/// What the caller should do after checking a just-arrived Confirmable
/// against the cache.
#[derive(Debug, Eq, PartialEq)]
pub enum DedupAction {
    /// First time seen: caller should dispatch to the handler normally.
    Dispatch,
    /// Already seen and already answered: caller should resend this exact
    /// response and must not dispatch to the handler again.
    Resend(Vec<u8>),
    /// Already seen, still being processed: caller must neither dispatch
    /// nor resend anything.
    Suppress,
}

/// Per-session cache of recently-seen `(remote, message_id)` pairs.
#[derive(Debug)]
pub struct DedupCache {
    exchange_lifetime: std::time::Duration,
    entries: std::sync::Mutex<HashMap<(SocketAddr, MsgId), Slot>>,
}

impl DedupCache {
    /// Creates a cache whose entries expire after `params.exchange_lifetime()`.
    pub fn new(params: &TransParams) -> DedupCache {
        DedupCache {
            exchange_lifetime: params.exchange_lifetime(),
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(SocketAddr, MsgId), Slot>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Recovering from mutex poisoning in DedupCache");
                poisoned.into_inner()
            }
        }
    }

    fn evict_expired(entries: &mut HashMap<(SocketAddr, MsgId), Slot>, exchange_lifetime: std::time::Duration) {
        let now = Instant::now();
        entries.retain(|_, slot| now.duration_since(slot.inserted_at) < exchange_lifetime);
    }

    /// Checks an inbound Confirmable against the cache, inserting a
    /// `Pending` entry if this is the first sighting. Eviction runs
    /// opportunistically on every call.
    pub fn check(&self, remote: SocketAddr, message_id: MsgId) -> DedupAction {
        let mut entries = self.lock();
        Self::evict_expired(&mut entries, self.exchange_lifetime);

        match entries.get(&(remote, message_id)) {
            Some(Slot { entry: Entry::Answered(response), .. }) => DedupAction::Resend(response.clone()),
            Some(Slot { entry: Entry::Pending, .. }) => DedupAction::Suppress,
            None => {
                entries.insert(
                    (remote, message_id),
                    Slot {
                        entry: Entry::Pending,
                        inserted_at: Instant::now(),
                    },
                );
                DedupAction::Dispatch
            }
        }
    }

    /// Records the response datagram the handler produced for a previously
    /// `Dispatch`-ed exchange, so later duplicates are answered with it
    /// instead of re-invoking the handler.
    pub fn record_response(&self, remote: SocketAddr, message_id: MsgId, response: Vec<u8>) {
        let mut entries = self.lock();
        if let Some(slot) = entries.get_mut(&(remote, message_id)) {
            slot.entry = Entry::Answered(response);
        }
    }

    /// Number of live entries. Exposed for tests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn remote() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn cache_with_lifetime(lifetime: Duration) -> DedupCache {
        let mut params = TransParams::default();
        // exchange_lifetime() is derived; drive it down via a tiny ack_timeout
        // and max_retransmit=0 so the test can wait it out quickly.
        params.ack_timeout = Duration::from_millis(1);
        params.max_retransmit = 0;
        params.max_latency = lifetime / 3;
        DedupCache::new(&params)
    }

    #[test]
    fn first_sighting_dispatches_then_suppresses_while_pending() {
        let cache = DedupCache::new(&TransParams::default());
        assert_eq!(cache.check(remote(), 0x30), DedupAction::Dispatch);
        assert_eq!(cache.check(remote(), 0x30), DedupAction::Suppress);
    }

    #[test]
    fn answered_entry_is_resent_verbatim() {
        let cache = DedupCache::new(&TransParams::default());
        cache.check(remote(), 0x30);
        cache.record_response(remote(), 0x30, vec![1, 2, 3]);
        assert_eq!(cache.check(remote(), 0x30), DedupAction::Resend(vec![1, 2, 3]));
    }

    #[test]
    fn distinct_message_ids_do_not_collide() {
        let cache = DedupCache::new(&TransParams::default());
        assert_eq!(cache.check(remote(), 1), DedupAction::Dispatch);
        assert_eq!(cache.check(remote(), 2), DedupAction::Dispatch);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn entries_expire_after_exchange_lifetime() {
        let cache = cache_with_lifetime(Duration::from_millis(20));
        cache.check(remote(), 0x30);
        cache.record_response(remote(), 0x30, vec![9]);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Past expiry: treated as a fresh sighting again.
        assert_eq!(cache.check(remote(), 0x30), DedupAction::Dispatch);
    }
}
