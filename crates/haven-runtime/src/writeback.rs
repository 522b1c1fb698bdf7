//! Write-behind persistence
//!
//! Operations commit in memory and queue their durable writes here. A single
//! task applies the queue in order with every store call bounded by a
//! timeout. Outcomes wait in a buffer until the engine collects them under
//! its own lock, so no operation ever holds that lock across store I/O.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use haven_core::{CheckpointId, UpdateId};
use haven_store::{encode_blob, BackingStore, StoreError, StoreResult};

/// Record a successful write makes durable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Durable {
    Checkpoint(CheckpointId),
    Update(UpdateId),
    Other,
}

/// Result of one store call, in completion order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Wrote(Durable),
    WriteFailed(Durable),
    /// A read, delete or listing failed
    Failed,
}

enum Job {
    Put {
        key: String,
        value: String,
        durable: Durable,
    },
    Remove {
        key: String,
    },
    /// Delete every stored key under the prefixes
    Purge { prefixes: Vec<&'static str> },
    Flush(oneshot::Sender<()>),
}

struct Worker {
    store: Arc<dyn BackingStore>,
    timeout: Duration,
    outcomes: Arc<Mutex<Vec<Outcome>>>,
    queued: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            let counted = !matches!(job, Job::Flush(_));
            match job {
                Job::Put {
                    key,
                    value,
                    durable,
                } => {
                    let outcome = match bounded(self.timeout, self.store.set_item(&key, value)).await
                    {
                        Ok(()) => Outcome::Wrote(durable),
                        Err(e) => {
                            tracing::warn!(%key, error = %e, "durable write failed, continuing in memory");
                            Outcome::WriteFailed(durable)
                        }
                    };
                    self.outcomes.lock().push(outcome);
                }
                Job::Remove { key } => self.remove(&key).await,
                Job::Purge { prefixes } => {
                    for prefix in prefixes {
                        match bounded(self.timeout, self.store.list_keys(prefix)).await {
                            Ok(keys) => {
                                for key in &keys {
                                    self.remove(key).await;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(prefix, error = %e, "stored keys could not be listed");
                                self.outcomes.lock().push(Outcome::Failed);
                            }
                        }
                    }
                }
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
            if counted {
                self.queued.fetch_sub(1, Ordering::SeqCst);
            }
        }
        tracing::debug!("write-behind queue closed");
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = bounded(self.timeout, self.store.remove_item(key)).await {
            tracing::warn!(%key, error = %e, "durable delete failed");
            self.outcomes.lock().push(Outcome::Failed);
        }
    }
}

async fn bounded<T>(limit: Duration, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Queue of durable writes drained by one background task. The task is
/// spawned on the first queued job and ends once the queue is dropped.
pub(crate) struct WriteBack {
    store: Arc<dyn BackingStore>,
    timeout: Duration,
    jobs: mpsc::UnboundedSender<Job>,
    idle: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    outcomes: Arc<Mutex<Vec<Outcome>>>,
    queued: Arc<AtomicUsize>,
}

impl WriteBack {
    pub fn new(store: Arc<dyn BackingStore>, timeout: Duration) -> Self {
        let (jobs, idle) = mpsc::unbounded_channel();
        WriteBack {
            store,
            timeout,
            jobs,
            idle: Mutex::new(Some(idle)),
            outcomes: Arc::new(Mutex::new(Vec::new())),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn send(&self, job: Job) {
        let idle = self.idle.lock().take();
        if let Some(receiver) = idle {
            let worker = Worker {
                store: self.store.clone(),
                timeout: self.timeout,
                outcomes: self.outcomes.clone(),
                queued: self.queued.clone(),
            };
            tokio::spawn(worker.run(receiver));
        }

        let counted = !matches!(job, Job::Flush(_));
        if counted {
            self.queued.fetch_add(1, Ordering::SeqCst);
        }
        if self.jobs.send(job).is_err() {
            if counted {
                self.queued.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::warn!("write-behind task is gone, write dropped");
        }
    }

    pub fn put(&self, key: String, blob: &[u8], durable: Durable) {
        self.send(Job::Put {
            key,
            value: encode_blob(blob),
            durable,
        });
    }

    pub fn remove(&self, key: String) {
        self.send(Job::Remove { key });
    }

    pub fn purge(&self, prefixes: Vec<&'static str>) {
        self.send(Job::Purge { prefixes });
    }

    /// Wait until every job queued before this call has been applied
    pub async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        self.send(Job::Flush(done));
        let _ = applied.await;
    }

    /// Bounded read straight from the store. Never queued, so callers must
    /// not hold the engine lock across it.
    pub async fn read(&self, key: &str) -> StoreResult<Option<String>> {
        let result = bounded(self.timeout, self.store.get_item(key)).await;
        if result.is_err() {
            self.outcomes.lock().push(Outcome::Failed);
        }
        result
    }

    /// Writes, deletes and purges not yet applied
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn take_outcomes(&self) -> Vec<Outcome> {
        std::mem::take(&mut *self.outcomes.lock())
    }
}
