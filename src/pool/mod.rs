//! Instance pool
//!
//! Decides which worker hosts each document and bounds how many exist.
//!
//! ```text
//!   acquire_for_open ──▶ admission (semaphore of document slots)
//!          │                 block: wait up to acquire_timeout
//!          │                 reject: fail now
//!          ▼
//!      OpenLease { worker, slot } ──commit(document)──▶ owners[scope] = worker
//!          │
//!          └─ dropped uncommitted: slot returned, per-document worker retired
//! ```
//!
//! All bookkeeping sits behind one `parking_lot::Mutex` that is never held
//! across an await or a worker call.

mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::{AdmissionPolicy, PoolConfig, PoolMode};
use crate::error::{DispatchError, Result};
use crate::references::DocumentRef;
use crate::worker::{Launcher, Worker, WorkerId};

pub use stats::PoolStats;
use stats::Counters;

struct WorkerEntry {
    worker: Arc<Worker>,
    /// Committed documents
    documents: usize,
    /// Leases handed out but not yet committed
    reserved: usize,
}

impl WorkerEntry {
    fn load(&self) -> usize {
        self.documents + self.reserved
    }
}

struct Ownership {
    worker: WorkerId,
    _slot: OwnedSemaphorePermit,
}

struct PoolState {
    workers: HashMap<WorkerId, WorkerEntry>,
    owners: HashMap<Uuid, Ownership>,
    /// Shared-mode recency, least recently used last
    recent: LruCache<WorkerId, ()>,
    /// Workers being started, counted against `max_workers`
    starting: usize,
    closed: bool,
}

impl PoolState {
    fn live_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| entry.worker.is_alive())
            .count()
    }

    /// Drop a worker from the pool; it stops once the last handle is gone
    fn retire(&mut self, id: WorkerId, counters: &Counters) -> Option<Arc<Worker>> {
        let entry = self.workers.remove(&id)?;
        self.recent.pop(&id);
        Counters::bump(&counters.retired);
        tracing::info!(worker = %id, alive = entry.worker.is_alive(), "retiring worker");
        Some(entry.worker)
    }
}

struct Inner {
    config: PoolConfig,
    launcher: Launcher,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_worker: AtomicU64,
    counters: Counters,
}

/// Where an open should go
enum Placement {
    Existing(Arc<Worker>),
    Start,
}

/// Releases a `starting` reservation, also when the open is cancelled
struct Starting<'a>(&'a Mutex<PoolState>);

impl Drop for Starting<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.starting = state.starting.saturating_sub(1);
    }
}

/// Pool of workers and the documents they own
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<Inner>,
}

impl InstanceManager {
    pub fn new(config: PoolConfig, launcher: Launcher) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;

        let slots = match (config.mode, config.max_documents_per_worker) {
            (PoolMode::PerDocument, _) => config.max_workers,
            (PoolMode::Shared, Some(per_worker)) => config.max_workers.saturating_mul(per_worker),
            (PoolMode::Shared, None) => Semaphore::MAX_PERMITS,
        }
        .min(Semaphore::MAX_PERMITS);

        tracing::info!(
            mode = ?config.mode,
            max_workers = config.max_workers,
            admission = ?config.admission,
            launcher = ?launcher,
            "instance pool ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(slots)),
                state: Mutex::new(PoolState {
                    workers: HashMap::new(),
                    owners: HashMap::new(),
                    recent: LruCache::unbounded(),
                    starting: 0,
                    closed: false,
                }),
                next_worker: AtomicU64::new(1),
                counters: Counters::default(),
                config,
                launcher,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Reserve capacity and a worker for one open-document request
    pub async fn acquire_for_open(&self) -> Result<OpenLease> {
        let slot = self.admit().await?;
        let worker = match self.place()? {
            Placement::Existing(worker) => worker,
            Placement::Start => self.start_worker().await?,
        };
        Ok(OpenLease {
            inner: Arc::clone(&self.inner),
            worker,
            slot: Some(slot),
        })
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let inner = &self.inner;
        let slots = Arc::clone(&inner.slots);
        let admitted = match inner.config.admission {
            AdmissionPolicy::Reject => slots
                .try_acquire_owned()
                .map_err(|_| "no free document slot".to_string()),
            AdmissionPolicy::Block => {
                match tokio::time::timeout(inner.config.acquire_timeout, slots.acquire_owned()).await
                {
                    Ok(Ok(slot)) => Ok(slot),
                    Ok(Err(_)) => Err("pool is shut down".to_string()),
                    Err(_) => Err(format!(
                        "no free document slot within {:?}",
                        inner.config.acquire_timeout
                    )),
                }
            }
        };

        admitted.map_err(|reason| {
            Counters::bump(&inner.counters.rejected);
            tracing::warn!(reason = %reason, "open refused");
            DispatchError::PoolExhausted(reason)
        })
    }

    /// Pick a worker under the lock, reserving the choice
    fn place(&self) -> Result<Placement> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.closed {
            return Err(DispatchError::PoolExhausted("pool is shut down".into()));
        }

        let live = state.live_workers() + state.starting;
        if inner.config.mode == PoolMode::PerDocument || live < inner.config.max_workers {
            state.starting += 1;
            return Ok(Placement::Start);
        }

        let limit = inner.config.max_documents_per_worker.unwrap_or(usize::MAX);
        let candidate = state
            .recent
            .iter()
            .rev()
            .map(|(id, _)| *id)
            .find(|id| {
                state
                    .workers
                    .get(id)
                    .is_some_and(|entry| entry.worker.is_alive() && entry.load() < limit)
            });

        let Some(id) = candidate else {
            return Err(DispatchError::PoolExhausted(
                "every live worker is at document capacity".into(),
            ));
        };
        state.recent.get(&id);
        let entry = state
            .workers
            .get_mut(&id)
            .ok_or_else(|| DispatchError::PoolExhausted(format!("{id} vanished")))?;
        entry.reserved += 1;
        tracing::debug!(worker = %id, load = entry.load(), "open placed on shared worker");
        Ok(Placement::Existing(Arc::clone(&entry.worker)))
    }

    async fn start_worker(&self) -> Result<Arc<Worker>> {
        let inner = &self.inner;
        let id = WorkerId(inner.next_worker.fetch_add(1, Ordering::Relaxed));
        let starting = Starting(&inner.state);
        let spawned = Worker::spawn(id, &inner.launcher).await;
        drop(starting);

        let worker = Arc::new(spawned?);
        let mut state = inner.state.lock();
        if state.closed {
            return Err(DispatchError::PoolExhausted("pool is shut down".into()));
        }
        Counters::bump(&inner.counters.spawned);
        state.workers.insert(
            id,
            WorkerEntry {
                worker: Arc::clone(&worker),
                documents: 0,
                reserved: 1,
            },
        );
        state.recent.put(id, ());
        Ok(worker)
    }

    /// Worker owning the document scope
    pub fn worker_for(&self, scope: Uuid) -> Result<Arc<Worker>> {
        let mut state = self.inner.state.lock();
        let Some(ownership) = state.owners.get(&scope) else {
            return Err(DispatchError::InvalidReference(format!(
                "no open document with scope {scope}"
            )));
        };
        let id = ownership.worker;
        let worker = state
            .workers
            .get(&id)
            .map(|entry| Arc::clone(&entry.worker))
            .ok_or_else(|| DispatchError::WorkerUnavailable(format!("{id} was retired")))?;
        if !worker.is_alive() {
            return Err(DispatchError::WorkerUnavailable(format!("{id} has exited")));
        }
        state.recent.get(&id);
        Ok(worker)
    }

    /// Forget a closed document and return its slot
    ///
    /// Per-document workers are retired with their document; shared workers
    /// only once they are dead and empty.
    pub async fn release_document(&self, scope: Uuid) {
        let retired = {
            let mut state = self.inner.state.lock();
            let Some(ownership) = state.owners.remove(&scope) else {
                return;
            };
            let id = ownership.worker;
            let retire = match state.workers.get_mut(&id) {
                Some(entry) => {
                    entry.documents = entry.documents.saturating_sub(1);
                    self.inner.config.mode == PoolMode::PerDocument
                        || (!entry.worker.is_alive() && entry.load() == 0)
                }
                None => false,
            };
            tracing::debug!(worker = %id, scope = %scope, "document released");
            if retire {
                state.retire(id, &self.inner.counters)
            } else {
                None
            }
        };

        if let Some(worker) = retired {
            worker.shutdown().await;
        }
    }

    /// Stop every worker; later opens fail with `PoolExhausted`
    pub async fn shutdown(&self) {
        self.inner.slots.close();
        let workers: Vec<Arc<Worker>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.owners.clear();
            state.recent.clear();
            let ids: Vec<WorkerId> = state.workers.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.retire(id, &self.inner.counters))
                .collect()
        };
        tracing::info!(workers = workers.len(), "shutting down instance pool");
        futures::future::join_all(workers.iter().map(|worker| worker.shutdown())).await;
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = inner.state.lock();
        PoolStats {
            mode: inner.config.mode,
            workers: state.workers.len(),
            live_workers: state.live_workers(),
            documents: state.owners.len(),
            pending_opens: state.workers.values().map(|entry| entry.reserved).sum(),
            available_slots: inner.slots.available_permits(),
            max_workers: inner.config.max_workers,
            spawned: Counters::read(&inner.counters.spawned),
            retired: Counters::read(&inner.counters.retired),
            opened: Counters::read(&inner.counters.opened),
            rejected: Counters::read(&inner.counters.rejected),
        }
    }
}

/// Capacity and a worker reserved for one open
///
/// Commit it with the opened document. Dropping it uncommitted returns the
/// slot; a per-document worker is retired with it.
pub struct OpenLease {
    inner: Arc<Inner>,
    worker: Arc<Worker>,
    slot: Option<OwnedSemaphorePermit>,
}

impl OpenLease {
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Record `document` as owned by the leased worker
    pub fn commit(mut self, document: DocumentRef) -> Result<()> {
        let id = self.worker.id();
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(DispatchError::PoolExhausted("pool is shut down".into()));
        }
        let Some(slot) = self.slot.take() else {
            return Err(DispatchError::InvalidState("lease already committed".into()));
        };
        let Some(entry) = state.workers.get_mut(&id) else {
            return Err(DispatchError::WorkerUnavailable(format!("{id} was retired")));
        };
        entry.reserved = entry.reserved.saturating_sub(1);
        entry.documents += 1;
        state.owners.insert(
            document.scope(),
            Ownership {
                worker: id,
                _slot: slot,
            },
        );
        Counters::bump(&self.inner.counters.opened);
        tracing::debug!(worker = %id, document = %document, "document opened");
        Ok(())
    }
}

impl Drop for OpenLease {
    fn drop(&mut self) {
        if self.slot.is_none() {
            return;
        }
        let id = self.worker.id();
        let mut state = self.inner.state.lock();
        let retire = match state.workers.get_mut(&id) {
            Some(entry) => {
                entry.reserved = entry.reserved.saturating_sub(1);
                self.inner.config.mode == PoolMode::PerDocument
                    || (!entry.worker.is_alive() && entry.load() == 0)
            }
            None => false,
        };
        if retire {
            // the worker stops when its last handle, this lease's, drops
            state.retire(id, &self.inner.counters);
        }
    }
}
