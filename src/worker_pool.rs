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

//! Work dispatch: handler invocation is offloaded here so the session
//! reader task never blocks on user code.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A pluggable submission point for offloaded work.
///
/// `submit` is best-effort: a saturated or shut-down pool rejects the
/// submission rather than queuing indefinitely, so the reader task always
/// gets an immediate accept/reject decision.
pub trait WorkerPool: Send + Sync {
    /// Submits `task` for execution. Returns `true` if accepted.
    fn submit(&self, task: BoxFuture<'static, ()>) -> bool;
}

/// The default [`WorkerPool`], backed by `tokio::task::spawn` and bounded by
/// a semaphore sized independently of any per-remote `NSTART` limit.
#[derive(Debug)]
pub struct TokioWorkerPool {
    semaphore: Arc<Semaphore>,
}

impl TokioWorkerPool {
    /// Creates a pool that runs at most `capacity` handler tasks concurrently.
    pub fn new(capacity: usize) -> TokioWorkerPool {
        TokioWorkerPool {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }
}

impl WorkerPool for TokioWorkerPool {
    fn submit(&self, task: BoxFuture<'static, ()>) -> bool {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        tokio::spawn(async move {
            task.await;
            drop(permit);
        });

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_submitted_work() {
        let pool = TokioWorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();

        assert!(pool.submit(Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })));

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_submission_when_saturated() {
        let pool = TokioWorkerPool::new(1);
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(Some(gate_rx)));

        assert!(pool.submit(Box::pin({
            let gate_rx = gate_rx.clone();
            async move {
                let rx = gate_rx.lock().await.take().unwrap();
                let _ = rx.await;
            }
        })));

        tokio::task::yield_now().await;

        // The single slot is occupied waiting on the gate: next submission is rejected.
        assert!(!pool.submit(Box::pin(async {})));

        let _ = gate_tx.send(());
    }
}
