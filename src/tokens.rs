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

//! Correlation of response tokens to waiting handlers, including the
//! observe extension's freshness rule.
//!
//! Grounded in the shape of a keyed response-handler table the way the
//! teacher's datagram backend tracks in-flight requests, generalised here
//! into two registration kinds instead of one.

use crate::error::Error;
use crate::message::{MsgToken, OwnedMessage};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How a registration behaves once its first notification arrives.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TokenKind {
    /// Fires once, then is removed.
    OneShot,
    /// Fires repeatedly until cancelled, de-registered by the peer (a
    /// response with no Observe option), or a 4.xx/5.xx arrives.
    Observer,
}

/// The channel end a registration delivers notifications through.
pub type NotificationSender = mpsc::Sender<Result<OwnedMessage, Error>>;

struct Registration {
    kind: TokenKind,
    sender: NotificationSender,
    last_observe: Option<(u32, Instant)>,
}

/// Facts about one inbound message relevant to token dispatch, extracted
/// by the caller before calling [`TokenRegistry::dispatch`].
#[derive(Debug)]
pub struct DispatchInfo {
    pub is_error_class: bool,
    pub observe_seq: Option<u32>,
}

/// Per-session table mapping request tokens to the handler awaiting their
/// response.
pub struct TokenRegistry {
    freshness_window: Duration,
    entries: std::sync::Mutex<HashMap<MsgToken, Registration>>,
}

impl TokenRegistry {
    /// Creates an empty registry. `freshness_window` is the `T(v1) + window
    /// < T(v2)` term in the observe freshness rule (default 128 s).
    pub fn new(freshness_window: Duration) -> TokenRegistry {
        TokenRegistry {
            freshness_window,
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MsgToken, Registration>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Recovering from mutex poisoning in TokenRegistry");
                poisoned.into_inner()
            }
        }
    }

    /// Registers `sender` to receive notifications addressed to `token`.
    pub fn register(&self, token: MsgToken, kind: TokenKind, sender: NotificationSender) {
        self.lock().insert(
            token,
            Registration {
                kind,
                sender,
                last_observe: None,
            },
        );
    }

    /// Removes the registration for `token`, if any. Idempotent.
    pub fn cancel(&self, token: &MsgToken) -> bool {
        self.lock().remove(token).is_some()
    }

    /// Dispatches a decoded notification addressed to `token`.
    ///
    /// Returns `(consumed, keep_registered)`: `consumed` is true if a
    /// registration existed and the notification was handed to it (subject
    /// to the freshness rule for observers); `keep_registered` is true if
    /// the registration should still be considered live afterward.
    pub fn dispatch(&self, token: &MsgToken, info: &DispatchInfo, message: OwnedMessage) -> (bool, bool) {
        let mut entries = self.lock();
        let registration = match entries.get_mut(token) {
            Some(r) => r,
            None => return (false, false),
        };

        if registration.kind == TokenKind::Observer {
            if let Some(seq) = info.observe_seq {
                let now = Instant::now();
                if let Some((last_seq, last_at)) = registration.last_observe {
                    if !is_fresher(last_seq, last_at, seq, now, self.freshness_window) {
                        // Stale relative to a previously delivered notification: drop it
                        // but keep the registration alive.
                        return (false, true);
                    }
                }
                registration.last_observe = Some((seq, now));
            }
        }

        let terminal = info.is_error_class || (registration.kind == TokenKind::Observer && info.observe_seq.is_none());
        let keep_registered = registration.kind == TokenKind::Observer && !terminal;

        if let Err(err) = registration.sender.try_send(Ok(message)) {
            log::warn!("Dropping notification for token {:?}: channel full or closed ({})", token, err);
        }

        if !keep_registered {
            entries.remove(token);
        }

        (true, keep_registered)
    }

    /// Fails every registered handler with `Error::Cancelled`, for session
    /// shutdown.
    pub fn cancel_all(&self) {
        for (_, registration) in self.lock().drain() {
            let _ = registration.sender.try_send(Err(Error::Cancelled));
        }
    }

    /// Number of live registrations. Exposed for tests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// The observe freshness rule: does `v2` (observed at `t2`) supersede `v1`
/// (observed at `t1`)? `v1`/`v2` are 24-bit sequence numbers.
fn is_fresher(v1: u32, t1: Instant, v2: u32, t2: Instant, freshness_window: Duration) -> bool {
    const MOD: u32 = 1 << 24;
    const HALF: u32 = 1 << 23;

    let forward_wrap = v1 < v2 && v2 - v1 < HALF;
    let backward_wrap = v1 > v2 && v1 - v2 > HALF;
    let time_based = t2 >= t1 && t2.duration_since(t1) > freshness_window;

    debug_assert!(v1 < MOD && v2 < MOD, "observe sequence numbers are 24-bit");

    forward_wrap || backward_wrap || time_based
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> MsgToken {
        MsgToken::from(7u32)
    }

    #[tokio::test]
    async fn one_shot_consumes_and_removes_on_first_dispatch() {
        let registry = TokenRegistry::new(Duration::from_secs(128));
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(token(), TokenKind::OneShot, tx);

        let info = DispatchInfo { is_error_class: false, observe_seq: None };
        let (consumed, keep) = registry.dispatch(&token(), &info, OwnedMessage::new());
        assert!(consumed);
        assert!(!keep);
        assert_eq!(registry.len(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn observer_survives_successive_notifications() {
        let registry = TokenRegistry::new(Duration::from_secs(128));
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(token(), TokenKind::Observer, tx);

        let info = DispatchInfo { is_error_class: false, observe_seq: Some(1) };
        let (consumed, keep) = registry.dispatch(&token(), &info, OwnedMessage::new());
        assert!(consumed && keep);

        let info2 = DispatchInfo { is_error_class: false, observe_seq: Some(2) };
        let (consumed, keep) = registry.dispatch(&token(), &info2, OwnedMessage::new());
        assert!(consumed && keep);
        assert_eq!(registry.len(), 1);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn observer_drops_stale_notification() {
        let registry = TokenRegistry::new(Duration::from_secs(128));
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(token(), TokenKind::Observer, tx);

        let fresh = DispatchInfo { is_error_class: false, observe_seq: Some(10) };
        registry.dispatch(&token(), &fresh, OwnedMessage::new());

        // Sequence number went backward and not past the wraparound threshold: stale.
        let stale = DispatchInfo { is_error_class: false, observe_seq: Some(9) };
        let (consumed, keep) = registry.dispatch(&token(), &stale, OwnedMessage::new());
        assert!(!consumed && keep);
        assert_eq!(registry.len(), 1);

        // Only the first (fresh) notification made it through the channel.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn observer_terminates_on_error_class_response() {
        let registry = TokenRegistry::new(Duration::from_secs(128));
        let (tx, _rx) = mpsc::channel(4);
        registry.register(token(), TokenKind::Observer, tx);

        let info = DispatchInfo { is_error_class: true, observe_seq: None };
        let (consumed, keep) = registry.dispatch(&token(), &info, OwnedMessage::new());
        assert!(consumed && !keep);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn observer_terminates_when_peer_drops_observe_option() {
        let registry = TokenRegistry::new(Duration::from_secs(128));
        let (tx, _rx) = mpsc::channel(4);
        registry.register(token(), TokenKind::Observer, tx);

        let info = DispatchInfo { is_error_class: false, observe_seq: None };
        let (consumed, keep) = registry.dispatch(&token(), &info, OwnedMessage::new());
        assert!(consumed && !keep);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let registry = TokenRegistry::new(Duration::from_secs(128));
        let (tx, _rx) = mpsc::channel(1);
        registry.register(token(), TokenKind::OneShot, tx);
        assert!(registry.cancel(&token()));
        assert!(!registry.cancel(&token()));
    }

    #[tokio::test]
    async fn cancel_all_delivers_cancelled_error() {
        let registry = TokenRegistry::new(Duration::from_secs(128));
        let (tx, mut rx) = mpsc::channel(1);
        registry.register(token(), TokenKind::OneShot, tx);
        registry.cancel_all();
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), Error::Cancelled);
    }
}
