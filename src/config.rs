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

//! Configuration surface recognised by a [`crate::session::Session`] and the
//! components it owns.

use crate::trans_params::TransParams;
use std::time::Duration;

/// Block-wise transfer tuning.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BlockwiseConfig {
    /// Whether block-wise transfer is offered/honoured at all.
    pub enable: bool,
    /// Preferred block size exponent (0..6 → 16..1024 bytes).
    pub szx: u8,
    /// Idle timeout for an in-progress transfer.
    pub transfer_timeout: Duration,
}

impl Default for BlockwiseConfig {
    fn default() -> Self {
        BlockwiseConfig {
            enable: true,
            szx: 6,
            transfer_timeout: Duration::from_secs(5),
        }
    }
}

/// Empty-CON keepalive probing.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct KeepaliveConfig {
    /// Interval between probes. `None` disables keepalive entirely.
    pub interval: Option<Duration>,
    /// Probes attempted before declaring the peer unreachable.
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: None,
            max_retries: 3,
        }
    }
}

/// The full set of tunables recognised across the session driver and the
/// components it owns.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Config {
    /// Reject decoded messages larger than this as `MessageTooLarge`.
    pub max_message_size: usize,
    /// Granularity for cancel polling on socket operations.
    pub heart_beat: Duration,
    /// Retransmission timing; `ack_timeout`/`ack_random_factor`/
    /// `max_retransmit`/`nstart` all live on this struct.
    pub transmission: TransParams,
    pub blockwise: BlockwiseConfig,
    pub keepalive: KeepaliveConfig,
    /// Window, in the observe freshness rule, beyond which a notification is
    /// considered fresh regardless of its sequence number.
    pub observer_freshness_window: Duration,
    /// Upper bound on concurrently-dispatched handler invocations, shared
    /// across every Session served by one endpoint.
    pub worker_pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_message_size: 65535,
            heart_beat: Duration::from_millis(100),
            transmission: TransParams::default(),
            blockwise: BlockwiseConfig::default(),
            keepalive: KeepaliveConfig::default(),
            observer_freshness_window: Duration::from_secs(128),
            worker_pool_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_message_size, 65535);
        assert_eq!(config.heart_beat, Duration::from_millis(100));
        assert_eq!(config.transmission.ack_timeout, Duration::from_secs(2));
        assert_eq!(config.transmission.ack_random_factor, 1.5);
        assert_eq!(config.transmission.max_retransmit, 4);
        assert_eq!(config.transmission.nstart, 1);
        assert!(config.blockwise.enable);
        assert_eq!(config.blockwise.szx, 6);
        assert_eq!(config.blockwise.transfer_timeout, Duration::from_secs(5));
        assert_eq!(config.observer_freshness_window, Duration::from_secs(128));
    }
}
