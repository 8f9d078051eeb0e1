use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use huddle_types::HuddleError;

use crate::action::{ActionPayload, QueuedAction};
use crate::queue::OfflineQueue;
use crate::sender::{ActionSender, SendError};

/// Terminal report for an action that exhausted its attempts. Emitted once
/// per action.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub action: QueuedAction,
    pub last_error: String,
}

impl DeliveryFailure {
    pub fn error(&self) -> HuddleError {
        HuddleError::Delivery {
            attempts: self.action.attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Server confirmed; the entry is gone.
    Confirmed,
    /// Failed, still queued with this many attempts.
    Retry(u32),
    /// Failed for the last time; removed and reported.
    Abandoned,
    /// No sender can take it right now. Not counted as an attempt.
    NoChannel,
    /// Another task is already sending it, or it was already settled.
    Skipped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub confirmed: usize,
    pub retrying: usize,
    pub abandoned: usize,
    pub deferred: usize,
}

/// Client-side offline synchronizer. Cheap to clone.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    queue: Arc<OfflineQueue>,
    /// In preference order; the first available sender that supports an
    /// action's kind gets it.
    senders: Vec<Arc<dyn ActionSender>>,
    online: AtomicBool,
    in_flight: Mutex<HashSet<Uuid>>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    max_attempts: u32,
}

/// Releases an in-flight claim when the attempt ends, however it ends.
struct Claim<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl Synchronizer {
    pub fn new(
        queue: OfflineQueue,
        senders: Vec<Arc<dyn ActionSender>>,
        max_attempts: u32,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryFailure>) {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let sync = Self {
            inner: Arc::new(SyncInner {
                queue: Arc::new(queue),
                senders,
                online: AtomicBool::new(false),
                in_flight: Mutex::new(HashSet::new()),
                failures,
                max_attempts: max_attempts.max(1),
            }),
        };
        (sync, failure_rx)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Run a blocking queue operation off the async runtime.
    async fn queue_call<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&OfflineQueue) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = self.inner.queue.clone();
        tokio::task::spawn_blocking(move || f(&queue)).await?
    }

    /// Persist the action, then try it at once if online. The returned id
    /// is also the server-side idempotency key.
    pub async fn enqueue(&self, payload: ActionPayload) -> anyhow::Result<Uuid> {
        let action = QueuedAction::new(payload);
        let id = action.id;
        let stored = action.clone();
        self.queue_call(move |q| q.put(&stored)).await?;

        if self.is_online() {
            self.attempt(id).await?;
        } else {
            debug!("Offline; {} action {} left queued", action.kind(), id);
        }
        Ok(id)
    }

    /// Record a connectivity change. Going from offline to online replays
    /// the whole queue.
    pub async fn on_connectivity_change(&self, online: bool) -> anyhow::Result<ReplaySummary> {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("Connectivity restored, replaying offline queue");
            return self.replay().await;
        }
        if !online && was_online {
            info!("Connectivity lost; new actions will be queued");
        }
        Ok(ReplaySummary::default())
    }

    /// Attempt every queued entry once, oldest first.
    pub async fn replay(&self) -> anyhow::Result<ReplaySummary> {
        let entries = self.queue_call(|q| q.all()).await?;
        let mut summary = ReplaySummary::default();
        for entry in entries {
            match self.attempt(entry.id).await? {
                Attempt::Confirmed => summary.confirmed += 1,
                Attempt::Retry(_) => summary.retrying += 1,
                Attempt::Abandoned => summary.abandoned += 1,
                Attempt::NoChannel => summary.deferred += 1,
                Attempt::Skipped => {}
            }
        }
        if summary != ReplaySummary::default() {
            info!(
                "Replay finished: {} confirmed, {} retrying, {} abandoned, {} deferred",
                summary.confirmed, summary.retrying, summary.abandoned, summary.deferred
            );
        }
        Ok(summary)
    }

    /// One delivery attempt for one entry. Concurrent attempts on the same
    /// id collapse to one.
    pub async fn attempt(&self, id: Uuid) -> anyhow::Result<Attempt> {
        {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .map_err(|e| anyhow::anyhow!("in-flight set poisoned: {}", e))?;
            if !in_flight.insert(id) {
                return Ok(Attempt::Skipped);
            }
        }
        let _claim = Claim {
            set: &self.inner.in_flight,
            id,
        };

        // Re-read under the claim; a previous holder may have settled it.
        let Some(action) = self.queue_call(move |q| q.get(id)).await? else {
            return Ok(Attempt::Skipped);
        };

        let Some(sender) = self.pick_sender(&action).await else {
            return Ok(Attempt::NoChannel);
        };

        match sender.send(&action).await {
            Ok(()) => {
                self.queue_call(move |q| q.delete(id)).await?;
                debug!("{} action {} confirmed via {}", action.kind(), id, sender.name());
                Ok(Attempt::Confirmed)
            }
            Err(e) => self.fail(action, sender.name(), e).await,
        }
    }

    async fn pick_sender(&self, action: &QueuedAction) -> Option<Arc<dyn ActionSender>> {
        for sender in &self.inner.senders {
            if sender.supports(action.kind()) && sender.is_available().await {
                return Some(sender.clone());
            }
        }
        None
    }

    async fn fail(
        &self,
        mut action: QueuedAction,
        via: &str,
        err: SendError,
    ) -> anyhow::Result<Attempt> {
        let id = action.id;
        let now = Utc::now();
        let Some(attempts) = self.queue_call(move |q| q.record_failure(id, now)).await? else {
            return Ok(Attempt::Skipped);
        };

        if attempts < self.inner.max_attempts {
            warn!(
                "{} action {} failed via {} (attempt {}/{}): {}",
                action.kind(),
                id,
                via,
                attempts,
                self.inner.max_attempts,
                err
            );
            return Ok(Attempt::Retry(attempts));
        }

        // Only the caller that actually removes the entry reports it.
        if !self.queue_call(move |q| q.delete(id)).await? {
            return Ok(Attempt::Skipped);
        }
        action.attempts = attempts;
        action.last_attempt_at = Some(now);
        error!(
            "{} action {} abandoned after {} attempts: {}",
            action.kind(),
            id,
            attempts,
            err
        );
        let _ = self.inner.failures.send(DeliveryFailure {
            action,
            last_error: err.to_string(),
        });
        Ok(Attempt::Abandoned)
    }

    pub async fn pending(&self, group_id: Uuid) -> anyhow::Result<Vec<QueuedAction>> {
        self.queue_call(move |q| q.by_group(group_id)).await
    }

    pub async fn pending_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<QueuedAction>> {
        self.queue_call(move |q| q.since(since)).await
    }

    pub async fn pending_count(&self) -> anyhow::Result<usize> {
        self.queue_call(|q| q.count()).await
    }
}
