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

//! Block1/Block2 multi-datagram transfer: request-body reassembly keyed by
//! request fingerprint, and response-body slicing with content-stability
//! caching.
//!
//! `BlockInfo` (the `(NUM << 4) | (M << 3) | SZX` packing) lives in
//! [`crate::block`]; this module owns the state machine built on top of it.

use crate::block::BlockInfo;
use crate::content_format::ContentFormat;
use crate::error::Error;
use crate::message::{MsgCode, MsgToken};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Identifies one block-wise transfer: the same request replayed with
/// successive block numbers must hash identically.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Fingerprint {
    pub remote: SocketAddr,
    pub token: MsgToken,
    pub method: MsgCode,
    /// Encoded cache-keyed options (everything except NoCacheKey-class
    /// options such as Block1/Block2 and response ETag).
    pub cache_key: Vec<u8>,
}

/// Where one side of a transfer sits in its lifecycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferState {
    Idle,
    Transferring,
    Complete,
    Aborted,
    Expired,
}

struct Block1Transfer {
    buffer: Vec<u8>,
    next_num: u32,
    szx: u8,
    state: TransferState,
    deadline: Instant,
}

struct Block2Cache {
    payload: Vec<u8>,
    code: MsgCode,
    content_format: Option<ContentFormat>,
    szx: u8,
    deadline: Instant,
}

/// Result of offering one Block1 chunk to the assembler.
#[derive(Debug, Eq, PartialEq)]
pub enum Block1Outcome {
    /// More blocks expected; respond 2.31 Continue echoing this `BlockInfo`.
    Continue(BlockInfo),
    /// Final block received; the full reassembled payload is returned and
    /// the transfer state is removed.
    Complete(Vec<u8>),
}

/// Server-side (or proxy-side) block-wise transfer state, one instance per
/// Session.
pub struct BlockwiseEngine {
    transfer_timeout: Duration,
    max_assembly_size: usize,
    block1: std::sync::Mutex<HashMap<Fingerprint, Block1Transfer>>,
    block2: std::sync::Mutex<HashMap<Fingerprint, Block2Cache>>,
}

impl BlockwiseEngine {
    /// `transfer_timeout` is the idle deadline (`Expired` fires after this
    /// much inactivity); `max_assembly_size` bounds a Block1 reassembly
    /// buffer before `RequestEntityTooLarge` is raised.
    pub fn new(transfer_timeout: Duration, max_assembly_size: usize) -> BlockwiseEngine {
        BlockwiseEngine {
            transfer_timeout,
            max_assembly_size,
            block1: std::sync::Mutex::new(HashMap::new()),
            block2: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_block1(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, Block1Transfer>> {
        match self.block1.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Recovering from mutex poisoning in BlockwiseEngine (block1)");
                poisoned.into_inner()
            }
        }
    }

    fn lock_block2(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, Block2Cache>> {
        match self.block2.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Recovering from mutex poisoning in BlockwiseEngine (block2)");
                poisoned.into_inner()
            }
        }
    }

    /// Offers one Block1-tagged chunk of a request body for reassembly.
    ///
    /// A non-matching SZX from the peer is accepted by lowering our
    /// expectation to whichever SZX is smaller, per §4.6.
    pub fn offer_block1(&self, fp: Fingerprint, block: BlockInfo, chunk: &[u8]) -> Result<Block1Outcome, Error> {
        if block.is_invalid() {
            return Err(Error::InvalidOption);
        }

        let mut transfers = self.lock_block1();
        let now = Instant::now();

        let transfer = transfers.entry(fp.clone()).or_insert_with(|| Block1Transfer {
            buffer: Vec::new(),
            next_num: 0,
            szx: block.szx(),
            state: TransferState::Idle,
            deadline: now + self.transfer_timeout,
        });

        if now > transfer.deadline {
            transfers.remove(&fp);
            return Err(Error::BlockTransferTimeout);
        }

        if block.num() != transfer.next_num {
            transfers.remove(&fp);
            return Err(Error::RequestEntityIncomplete);
        }

        let effective_szx = transfer.szx.min(block.szx());
        let expected_len = 1usize << (effective_szx as usize + 4);
        if block.more_flag() && chunk.len() != expected_len {
            transfers.remove(&fp);
            return Err(Error::RequestEntityIncomplete);
        }

        if transfer.buffer.len() + chunk.len() > self.max_assembly_size {
            transfers.remove(&fp);
            return Err(Error::RequestEntityTooLarge);
        }

        transfer.buffer.extend_from_slice(chunk);
        transfer.szx = effective_szx;
        transfer.next_num += 1;
        transfer.deadline = now + self.transfer_timeout;
        transfer.state = TransferState::Transferring;

        if block.more_flag() {
            let echo = BlockInfo::new(block.num(), true, effective_szx).expect("bounds already validated");
            Ok(Block1Outcome::Continue(echo))
        } else {
            transfer.state = TransferState::Complete;
            let transfer = transfers.remove(&fp).expect("just inserted");
            Ok(Block1Outcome::Complete(transfer.buffer))
        }
    }

    /// Aborts an in-progress Block1 transfer (e.g. on request cancellation).
    pub fn abort_block1(&self, fp: &Fingerprint) {
        self.lock_block1().remove(fp);
    }

    /// Caches a freshly-computed response payload under `fp` for content
    /// stability across a Block2 series, and returns the first slice.
    pub fn start_block2(
        &self,
        fp: Fingerprint,
        payload: Vec<u8>,
        code: MsgCode,
        content_format: Option<ContentFormat>,
        szx: u8,
    ) -> (Vec<u8>, BlockInfo) {
        let cache = Block2Cache {
            payload,
            code,
            content_format,
            szx,
            deadline: Instant::now() + self.transfer_timeout,
        };
        let block_info = Self::slice_block_info(&cache, 0);
        let chunk = Self::slice_chunk(&cache, &block_info);
        self.lock_block2().insert(fp, cache);
        (chunk, block_info)
    }

    /// Serves one more block of a previously-started Block2 response,
    /// honouring the requested SZX if it is smaller than the cached one.
    ///
    /// Returns `None` if no cached response exists for `fp` (either never
    /// started, or its content-stability window has expired) — the caller
    /// should recompute the response from scratch.
    pub fn block2_slice(
        &self,
        fp: &Fingerprint,
        requested: BlockInfo,
    ) -> Option<(Vec<u8>, BlockInfo, MsgCode, Option<ContentFormat>)> {
        let mut caches = self.lock_block2();
        let cache = caches.get_mut(fp)?;

        if Instant::now() > cache.deadline {
            caches.remove(fp);
            return None;
        }

        cache.szx = cache.szx.min(requested.szx());
        cache.deadline = Instant::now() + self.transfer_timeout;

        let block_info = Self::slice_block_info(cache, requested.num());
        let chunk = Self::slice_chunk(cache, &block_info);
        Some((chunk, block_info, cache.code, cache.content_format))
    }

    fn slice_block_info(cache: &Block2Cache, num: u32) -> BlockInfo {
        let block_len = 1usize << (cache.szx as usize + 4);
        let offset = num as usize * block_len;
        let more = offset + block_len < cache.payload.len();
        BlockInfo::new(num, more, cache.szx).expect("bounds validated by caller")
    }

    fn slice_chunk(cache: &Block2Cache, block_info: &BlockInfo) -> Vec<u8> {
        let start = block_info.offset().min(cache.payload.len());
        let end = (start + block_info.len()).min(cache.payload.len());
        cache.payload[start..end].to_vec()
    }

    /// Removes every Block1/Block2 entry whose deadline has passed. Intended
    /// to be called on a periodic tick; entries are also reaped lazily on
    /// next access.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.lock_block1().retain(|_, t| now <= t.deadline);
        self.lock_block2().retain(|_, c| now <= c.deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(token: u32) -> Fingerprint {
        Fingerprint {
            remote: "127.0.0.1:5683".parse().unwrap(),
            token: MsgToken::from(token),
            method: MsgCode::MethodPut,
            cache_key: vec![],
        }
    }

    #[test]
    fn block1_reassembles_full_payload() {
        let engine = BlockwiseEngine::new(Duration::from_secs(5), 65535);
        let payload = vec![0xABu8; 2560];
        let szx = 6; // 1024-byte blocks

        let b0 = BlockInfo::new(0, true, szx).unwrap();
        let outcome = engine.offer_block1(fp(1), b0, &payload[0..1024]).unwrap();
        assert_eq!(outcome, Block1Outcome::Continue(BlockInfo::new(0, true, szx).unwrap()));

        let b1 = BlockInfo::new(1, true, szx).unwrap();
        let outcome = engine.offer_block1(fp(1), b1, &payload[1024..2048]).unwrap();
        assert_eq!(outcome, Block1Outcome::Continue(BlockInfo::new(1, true, szx).unwrap()));

        let b2 = BlockInfo::new(2, false, szx).unwrap();
        let outcome = engine.offer_block1(fp(1), b2, &payload[2048..2560]).unwrap();
        assert_eq!(outcome, Block1Outcome::Complete(payload));
    }

    #[test]
    fn block1_out_of_order_is_incomplete() {
        let engine = BlockwiseEngine::new(Duration::from_secs(5), 65535);
        let b1 = BlockInfo::new(1, false, 6).unwrap();
        assert_eq!(
            engine.offer_block1(fp(2), b1, b"late").unwrap_err(),
            Error::RequestEntityIncomplete
        );
    }

    #[test]
    fn block1_middle_block_size_mismatch_is_incomplete() {
        let engine = BlockwiseEngine::new(Duration::from_secs(5), 65535);
        let b0 = BlockInfo::new(0, true, 6).unwrap();
        // declares more blocks follow, but chunk is short of the full 1024 bytes.
        assert_eq!(
            engine.offer_block1(fp(3), b0, b"short").unwrap_err(),
            Error::RequestEntityIncomplete
        );
    }

    #[test]
    fn block1_overflow_is_too_large() {
        let engine = BlockwiseEngine::new(Duration::from_secs(5), 16);
        let b0 = BlockInfo::new(0, true, 0).unwrap(); // 16-byte blocks
        engine.offer_block1(fp(4), b0, &[0u8; 16]).unwrap();
        let b1 = BlockInfo::new(1, false, 0).unwrap();
        assert_eq!(
            engine.offer_block1(fp(4), b1, &[0u8; 16]).unwrap_err(),
            Error::RequestEntityTooLarge
        );
    }

    #[test]
    fn block2_slices_stay_stable_across_the_series() {
        let engine = BlockwiseEngine::new(Duration::from_secs(5), 65535);
        let payload: Vec<u8> = (0..2560u32).map(|i| i as u8).collect();

        let (chunk0, info0) = engine.start_block2(fp(5), payload.clone(), MsgCode::SuccessContent, None, 6);
        assert_eq!(chunk0, &payload[0..1024]);
        assert!(info0.more_flag());

        let requested = BlockInfo::new(1, false, 6).unwrap();
        let (chunk1, info1, code1, _) = engine.block2_slice(&fp(5), requested).unwrap();
        assert_eq!(chunk1, &payload[1024..2048]);
        assert!(info1.more_flag());
        assert_eq!(code1, MsgCode::SuccessContent);

        let requested = BlockInfo::new(2, false, 6).unwrap();
        let (chunk2, info2, _, _) = engine.block2_slice(&fp(5), requested).unwrap();
        assert_eq!(chunk2, &payload[2048..2560]);
        assert!(!info2.more_flag());
    }

    #[test]
    fn block2_honours_a_smaller_requested_szx() {
        let engine = BlockwiseEngine::new(Duration::from_secs(5), 65535);
        let payload: Vec<u8> = (0..64u32).map(|i| i as u8).collect();
        engine.start_block2(fp(6), payload.clone(), MsgCode::SuccessContent, Some(ContentFormat::TEXT_PLAIN_UTF8), 6);

        let requested = BlockInfo::new(0, false, 1).unwrap(); // 32-byte blocks
        let (chunk, info, _, content_format) = engine.block2_slice(&fp(6), requested).unwrap();
        assert_eq!(chunk, &payload[0..32]);
        assert_eq!(info.szx(), 1);
        assert!(info.more_flag());
        assert_eq!(content_format, Some(ContentFormat::TEXT_PLAIN_UTF8));
    }

    #[test]
    fn block2_miss_returns_none() {
        let engine = BlockwiseEngine::new(Duration::from_secs(5), 65535);
        let requested = BlockInfo::new(0, false, 6).unwrap();
        assert!(engine.block2_slice(&fp(7), requested).is_none());
    }
}
