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

//! CoAP transmission parameters, as a plain, runtime-configurable struct
//! rather than a trait of associated constants — callers who need
//! non-default tuning (e.g. for a lossy radio link) build one with
//! [`TransParams::new`] instead of implementing a trait.

use std::time::Duration;

/// The set of timers and limits governing Confirmable message retransmission.
///
/// [RFC7252 §4.8](https://tools.ietf.org/html/rfc7252#section-4.8).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TransParams {
    /// Maximum length of an outbound UDP datagram this endpoint will send.
    pub max_outbound_packet_length: usize,

    /// `MAX_RETRANSMIT`: number of retransmissions attempted before giving up.
    pub max_retransmit: u32,

    /// `ACK_TIMEOUT`: initial retransmission timeout.
    pub ack_timeout: Duration,

    /// `ACK_RANDOM_FACTOR`: multiplier applied to `ack_timeout` to produce jitter.
    pub ack_random_factor: f32,

    /// `NSTART`: number of simultaneous outstanding exchanges allowed per peer.
    pub nstart: u32,

    /// `MAX_LATENCY`: worst-case one-way datagram transit time assumed by this endpoint.
    pub max_latency: Duration,
}

impl TransParams {
    /// The standard parameters recommended by RFC7252 §4.8.
    pub const fn new() -> TransParams {
        TransParams {
            max_outbound_packet_length: 1152,
            max_retransmit: 4,
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            nstart: 1,
            max_latency: Duration::from_secs(100),
        }
    }

    /// `PROCESSING_DELAY`: conservatively assumed equal to `ack_timeout`.
    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout
    }

    /// `MAX_TRANSMIT_SPAN`: time from first transmission to last retransmission.
    ///
    /// `ACK_TIMEOUT * ((2 ** MAX_RETRANSMIT) - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_span(&self) -> Duration {
        Duration::from_millis(
            (self.ack_timeout.as_millis() as f32
                * ((1u32 << self.max_retransmit) - 1) as f32
                * self.ack_random_factor) as u64,
        )
    }

    /// `MAX_TRANSMIT_WAIT`: time from first transmission until giving up entirely.
    ///
    /// `ACK_TIMEOUT * ((2 ** (MAX_RETRANSMIT + 1)) - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_wait(&self) -> Duration {
        Duration::from_millis(
            (self.ack_timeout.as_millis() as f32
                * ((1u32 << (self.max_retransmit + 1)) - 1) as f32
                * self.ack_random_factor) as u64,
        )
    }

    /// `MAX_RTT`: `(2 * MAX_LATENCY) + PROCESSING_DELAY`.
    pub fn max_rtt(&self) -> Duration {
        2 * self.max_latency + self.processing_delay()
    }

    /// `EXCHANGE_LIFETIME`: `MAX_TRANSMIT_SPAN + (2 * MAX_LATENCY) + PROCESSING_DELAY`.
    ///
    /// The dedup cache and retransmit queue both key their eviction on this.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + 2 * self.max_latency + self.processing_delay()
    }

    /// `NON_LIFETIME`: `MAX_TRANSMIT_SPAN + MAX_LATENCY`.
    pub fn non_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency
    }

    /// Delay to wait before the `attempt`'th (re)transmission. `attempt` is
    /// zero-based: 0 means "send immediately", 1 means "the wait between the
    /// first and second transmission", and so on. Includes the random jitter
    /// mandated by `ACK_RANDOM_FACTOR`.
    pub fn calc_retransmit_duration(&self, mut attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_secs(0);
        }

        if attempt > self.max_retransmit {
            attempt = self.max_retransmit;
        }
        attempt -= 1;

        let base = (self.ack_timeout.as_millis() as u64) << attempt;

        const JDIV: u64 = 512;
        let rmod = (JDIV as f32 * (self.ack_random_factor - 1.0)) as u64;
        let jmul = JDIV + rand::random::<u64>() % rmod.max(1);

        Duration::from_millis(base * jmul / JDIV)
    }
}

impl Default for TransParams {
    fn default() -> Self {
        TransParams::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_derived_durations_match_rfc7252() {
        let p = TransParams::default();
        assert_eq!(p.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(p.max_transmit_wait(), Duration::from_millis(93_000));
        assert_eq!(p.max_rtt(), Duration::from_secs(202));
        assert_eq!(p.exchange_lifetime(), Duration::from_secs(247));
        assert_eq!(p.non_lifetime(), Duration::from_secs(145));
    }

    #[test]
    fn retransmit_duration_zero_is_immediate() {
        let p = TransParams::default();
        assert_eq!(p.calc_retransmit_duration(0), Duration::from_secs(0));
    }

    #[test]
    fn retransmit_duration_grows_and_caps_at_max_retransmit() {
        let p = TransParams::default();
        let d1 = p.calc_retransmit_duration(1);
        let d5 = p.calc_retransmit_duration(5);
        let d6 = p.calc_retransmit_duration(6);
        assert!(d1.as_millis() >= 2_000 && d1.as_millis() <= 3_000);
        // Attempt beyond max_retransmit clamps to the same bucket.
        assert_eq!(d5.as_millis() > 0, d6.as_millis() > 0);
        assert!(d5.as_millis() <= 32_000 && d6.as_millis() <= 32_000);
    }
}
