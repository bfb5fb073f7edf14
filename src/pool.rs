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

//! A process-wide pool of reusable [`OwnedMessage`] buffers, so the session
//! driver can build outbound messages and decode scratch space without an
//! allocation on every datagram.

use crate::message::OwnedMessage;
use std::sync::{Arc, Mutex};

/// Shared storage backing every [`PooledMessage`] checked out from a [`MessagePool`].
#[derive(Debug)]
struct Inner {
    free: Mutex<Vec<OwnedMessage>>,
}

/// A process-wide, thread-safe pool of [`OwnedMessage`] buffers.
///
/// Cloning a `MessagePool` shares the same underlying free list; callers
/// typically hold one `MessagePool` behind an `Arc` per process and clone it
/// into every `Session`.
#[derive(Debug, Clone)]
pub struct MessagePool {
    inner: Arc<Inner>,
}

impl MessagePool {
    /// Creates an empty pool. Buffers are allocated lazily on first `acquire`
    /// and recycled from then on.
    pub fn new() -> MessagePool {
        MessagePool {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Checks out a cleared [`OwnedMessage`], reusing a previously released
    /// buffer if one is available.
    pub fn acquire(&self) -> PooledMessage {
        let message = match self.inner.free.lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => {
                log::warn!("Recovering from mutex poisoning in MessagePool");
                poisoned.into_inner().pop()
            }
        };

        let mut message = message.unwrap_or_default();
        message.clear();

        PooledMessage {
            message: Some(message),
            pool: self.inner.clone(),
        }
    }

    /// Number of buffers currently idle in the free list. Exposed for tests.
    pub fn idle_count(&self) -> usize {
        match self.inner.free.lock() {
            Ok(free) => free.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Returns `message` directly to the free list, bypassing the usual
    /// checkout/drop cycle. For callers that took ownership of a buffer via
    /// [`PooledMessage::take`] and are done with it.
    pub fn release(&self, mut message: OwnedMessage) {
        message.clear();
        match self.inner.free.lock() {
            Ok(mut free) => free.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        MessagePool::new()
    }
}

/// A scoped checkout of an [`OwnedMessage`] from a [`MessagePool`].
///
/// On drop, the message is cleared and returned to the pool's free list
/// rather than deallocated.
#[derive(Debug)]
pub struct PooledMessage {
    message: Option<OwnedMessage>,
    pool: Arc<Inner>,
}

impl PooledMessage {
    /// Detaches the checked-out message, skipping the automatic return to
    /// the pool's free list on drop. The caller takes responsibility for
    /// eventually handing it back via [`MessagePool::release`].
    pub fn take(mut self) -> OwnedMessage {
        self.message.take().expect("PooledMessage used after release")
    }
}

impl std::ops::Deref for PooledMessage {
    type Target = OwnedMessage;

    fn deref(&self) -> &OwnedMessage {
        self.message.as_ref().expect("PooledMessage used after release")
    }
}

impl std::ops::DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut OwnedMessage {
        self.message.as_mut().expect("PooledMessage used after release")
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.clear();
            match self.pool.free.lock() {
                Ok(mut free) => free.push(message),
                Err(poisoned) => {
                    log::warn!("Recovering from mutex poisoning in MessagePool");
                    poisoned.into_inner().push(message)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused() {
        let pool = MessagePool::new();
        assert_eq!(pool.idle_count(), 0);

        {
            let mut msg = pool.acquire();
            msg.append_payload_bytes(b"hello");
            assert_eq!(msg.as_message().payload(), b"hello");
        }

        assert_eq!(pool.idle_count(), 1);

        let msg = pool.acquire();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(msg.as_message().payload(), b"");
    }

    #[test]
    fn pool_clone_shares_free_list() {
        let pool = MessagePool::new();
        let pool2 = pool.clone();

        drop(pool.acquire());
        assert_eq!(pool2.idle_count(), 1);
    }

    #[test]
    fn take_then_release_round_trips_through_the_pool() {
        let pool = MessagePool::new();
        let mut message = pool.acquire().take();
        message.append_payload_bytes(b"hi").unwrap();

        pool.release(message);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.acquire();
        assert_eq!(reused.as_message().payload(), b"");
    }
}
