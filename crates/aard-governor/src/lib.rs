mod cancellation;
mod quota;

pub use cancellation::CancellationRegistry;
pub use quota::{GovernorConfig, QuotaLimit, QuotaPeriod, QuotaResource};

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use aard_types::ErrorKind;
use quota::QuotaLedger;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Outcome of racing a suspension point against its wall clock and the
/// workflow cancellation token.
#[derive(Debug)]
pub enum Bounded<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

/// Cooperative bound: the future is polled until it completes, the timeout
/// fires, or the token is cancelled, whichever comes first.
pub async fn bounded<F: Future>(
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Bounded<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Bounded::Cancelled,
        _ = tokio::time::sleep(timeout) => Bounded::TimedOut,
        out = fut => Bounded::Completed(out),
    }
}

/// Releases one concurrent-task slot on drop.
pub struct TaskPermit {
    counter: Arc<AtomicI64>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-wide resource boundary: quota windows per resource, a concurrent
/// task cap, and the cancellation registry for cooperative aborts.
#[derive(Clone)]
pub struct Governor {
    ledger: Arc<RwLock<QuotaLedger>>,
    running_tasks: Arc<AtomicI64>,
    max_concurrent_tasks: Option<i64>,
    pub cancellations: CancellationRegistry,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            ledger: Arc::new(RwLock::new(QuotaLedger::new(config.limits))),
            running_tasks: Arc::new(AtomicI64::new(0)),
            max_concurrent_tasks: config.max_concurrent_tasks.map(|n| n as i64),
            cancellations: CancellationRegistry::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(GovernorConfig::default())
    }

    /// Checks `remaining >= cost` on every configured window for the
    /// resource, then commits the cost. Denial names the resource.
    pub async fn admit(&self, resource: QuotaResource, cost: u64) -> Result<(), ErrorKind> {
        self.admit_at(resource, cost, now_ms()).await
    }

    pub(crate) async fn admit_at(
        &self,
        resource: QuotaResource,
        cost: u64,
        now_ms: u64,
    ) -> Result<(), ErrorKind> {
        let mut ledger = self.ledger.write().await;
        if !ledger.check(resource, cost, now_ms) {
            tracing::warn!(
                target: "aard.governor",
                resource = resource.as_str(),
                cost,
                "quota denied"
            );
            return Err(ErrorKind::QuotaExceeded {
                resource: resource.as_str().to_string(),
            });
        }
        ledger.consume(resource, cost, now_ms);
        Ok(())
    }

    /// Commits usage measured after the fact (actual tokens, elapsed time).
    pub async fn record(&self, resource: QuotaResource, cost: u64) {
        self.ledger.write().await.consume(resource, cost, now_ms());
    }

    pub async fn remaining(&self, resource: QuotaResource) -> Option<u64> {
        self.ledger.write().await.remaining(resource, now_ms())
    }

    pub fn begin_task(&self) -> Result<TaskPermit, ErrorKind> {
        let running = self.running_tasks.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max) = self.max_concurrent_tasks {
            if running > max {
                self.running_tasks.fetch_sub(1, Ordering::SeqCst);
                return Err(ErrorKind::QuotaExceeded {
                    resource: QuotaResource::ConcurrentTasks.as_str().to_string(),
                });
            }
        }
        Ok(TaskPermit {
            counter: self.running_tasks.clone(),
        })
    }

    pub fn running_tasks(&self) -> i64 {
        self.running_tasks.load(Ordering::SeqCst)
    }
}
