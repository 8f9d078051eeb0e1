use std::sync::Arc;

use tokio::sync::Semaphore;

use huddle_db::Database;
use huddle_types::HuddleError;

/// Handle to the durable store that runs every call on the blocking pool,
/// with at most `workers` calls in flight. A call suspends only the task
/// that issued it.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    permits: Arc<Semaphore>,
}

impl Store {
    pub fn new(db: Database, workers: usize) -> Self {
        Self {
            db: Arc::new(db),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run `f` against the database off the async runtime. Any failure is
    /// logged with `context` and surfaced as the generic storage error.
    pub async fn call<F, T>(&self, context: &'static str, f: F) -> Result<T, HuddleError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| HuddleError::storage(context, e))?;

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(&db)
        })
        .await
        .map_err(|e| HuddleError::storage(context, e))?
        .map_err(|e| HuddleError::storage(context, e))
    }
}
