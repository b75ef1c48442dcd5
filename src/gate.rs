//! 后端发送并发闸门：固定槽位、FIFO 排队。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// 所有后端发送共用的进程级限流器。
///
/// `tokio::sync::Semaphore` 按请求顺序发放许可，闸门满时排队者先到先得。
/// 获取没有超时，调用方随请求一直等待。
#[derive(Debug, Clone)]
pub struct SendGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
    waiting: Arc<AtomicUsize>,
}

/// 持有期间占用一个发送槽位，drop 时归还。
#[derive(Debug)]
pub struct SendPermit {
    _permit: OwnedSemaphorePermit,
}

impl SendPermit {
    /// 显式归还槽位。
    pub fn release(self) {}
}

struct WaitingGuard(Arc<AtomicUsize>);

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SendGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 等待空闲槽位。
    pub async fn acquire(&self) -> Result<SendPermit, AcquireError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = WaitingGuard(self.waiting.clone());
        let permit = self.semaphore.clone().acquire_owned().await?;
        drop(guard);
        debug!(active = self.active(), limit = self.limit, "send slot acquired");
        Ok(SendPermit { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 当前正在进行的发送数。
    pub fn active(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// 排队等待槽位的调用数。
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test]
    async fn gate_admits_limit_then_resumes_waiters_in_fifo_order() {
        let gate = SendGate::new(3);
        let (acquired_tx, mut acquired_rx) = mpsc::unbounded_channel();
        let mut releases = Vec::new();

        for index in 0..10usize {
            let (release_tx, release_rx) = oneshot::channel::<()>();
            releases.push(release_tx);
            let task_gate = gate.clone();
            let acquired_tx = acquired_tx.clone();
            tokio::spawn(async move {
                let permit = task_gate.acquire().await.expect("gate open");
                acquired_tx.send(index).expect("send index");
                let _ = release_rx.await;
                permit.release();
            });
            while gate.active() + gate.waiting() < index + 1 {
                tokio::task::yield_now().await;
            }
        }

        let mut first = Vec::new();
        while let Ok(index) = acquired_rx.try_recv() {
            first.push(index);
        }
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(gate.active(), 3);
        assert_eq!(gate.waiting(), 7);

        let mut order = Vec::new();
        for release in releases.drain(..7) {
            release.send(()).expect("release");
            let next = acquired_rx.recv().await.expect("next acquirer");
            order.push(next);
        }
        assert_eq!(order, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_counts_consistent() {
        let gate = SendGate::new(1);
        let held = gate.acquire().await.expect("first permit");

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        while gate.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(gate.waiting(), 0);
        drop(held);
        assert_eq!(gate.active(), 0);
    }
}
