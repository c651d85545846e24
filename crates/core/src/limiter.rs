// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Concurrency Limiter Registry (§4.B) — the core of the system.
//!
//! Per-resource distributed semaphore with a bounded wait queue, wait
//! timeout, execution timeout, hot reconfiguration and auto-release on
//! client disconnect. The registry owns only a local LRU of *settings*
//! caches keyed by `resourceId`; running/queued counts live in the KV
//! store, mirroring `MuxState`'s split between in-process bookkeeping and
//! the remote source of truth.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelSignal;
use crate::config::{CoreConfig, LimiterConfig, NormalizedLimiterConfig};
use crate::error::{CoreError, CoreResult};
use crate::kv::KvClient;
use crate::time::epoch_ms;

/// Polling granularity used while a waiter is blocked on the distributed
/// semaphore. Small enough that `queueWaitSeconds` deadlines are honored
/// tightly without hammering the backend.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// TTL on the queued-waiters counter (`concurrency:queue:{resourceId}`),
/// per the external-interface contract's "10 min idle".
const QUEUE_COUNTER_IDLE_TTL: Duration = Duration::from_secs(600);

/// Extra TTL margin layered on top of `executionSeconds` when leasing the
/// running-set entry, so a missed release is still bounded by TTL.
const EXECUTION_LEASE_GRACE: Duration = Duration::from_secs(5);

fn next_job_id(resource_id: &str) -> String {
    format!("{resource_id}:{}", uuid::Uuid::new_v4())
}

struct LimiterEntry {
    settings: RwLock<NormalizedLimiterConfig>,
    last_access_ms: AtomicI64,
}

/// A concurrency slot admitted on some `resourceId`.
///
/// `release` is idempotent: it may be called explicitly by the caller, by
/// the background disconnect/timeout monitor, or implicitly on drop —
/// whichever happens first wins, and the rest are no-ops.
pub struct Handle {
    inner: Arc<HandleInner>,
    /// Reports why the background monitor ended this handle early
    /// (`ExecutionTimeout` or `ClientDisconnected`), per the state machine's
    /// `Admitted -> Released(..)` side exits. Stays open — never resolving —
    /// for a handle released normally via [`Handle::release`]; the sender
    /// is only ever written from the monitor task, never from `release()`
    /// itself, and is dropped unfired when the monitor ends for any other
    /// reason, which closes the channel so a caller awaiting it observes
    /// `None` rather than hanging forever.
    termination_rx: watch::Receiver<Option<CoreError>>,
}

struct HandleInner {
    resource_id: String,
    job_id: String,
    kv: Arc<dyn KvClient>,
    released: AtomicBool,
    monitor_stop: CancellationToken,
    noop: bool,
}

impl Handle {
    fn noop(resource_id: String, kv: Arc<dyn KvClient>) -> Self {
        // No monitor is ever spawned for a no-op handle, so the sender half
        // is dropped immediately — `termination_reason` resolves to `None`
        // right away rather than waiting on a channel nothing will signal.
        let (termination_tx, termination_rx) = watch::channel(None);
        drop(termination_tx);
        Self {
            inner: Arc::new(HandleInner {
                resource_id,
                job_id: String::new(),
                kv,
                released: AtomicBool::new(true),
                monitor_stop: CancellationToken::new(),
                noop: true,
            }),
            termination_rx,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.inner.resource_id
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Release the slot. Safe to call more than once, and safe to call
    /// after the background monitor has already released it.
    pub async fn release(&self) {
        self.inner.release().await;
    }

    /// Await the reason the background monitor released this slot early.
    /// Resolves to `Some(ExecutionTimeout)` or `Some(ClientDisconnected)` the
    /// moment either fires; resolves to `None` once the handle is instead
    /// released normally (the monitor task ends without ever firing, closing
    /// the channel). Callers race their own upstream work against this in a
    /// `select!` to observe an abnormal termination as it happens.
    pub async fn termination_reason(&self) -> Option<CoreError> {
        let mut rx = self.termination_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return Some(reason);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl HandleInner {
    async fn release(&self) {
        if self.noop {
            return;
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor_stop.cancel();
        let sem_key = format!("sem:{}", self.resource_id);
        if let Err(err) = self.kv.zrem(&sem_key, &self.job_id).await {
            tracing::warn!(
                resource_id = %self.resource_id,
                job_id = %self.job_id,
                error = %err,
                "failed to release concurrency slot; bounded by sem key TTL"
            );
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.noop || self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor_stop.cancel();
        let kv = Arc::clone(&self.kv);
        let resource_id = self.resource_id.clone();
        let job_id = self.job_id.clone();
        tokio::spawn(async move {
            let sem_key = format!("sem:{resource_id}");
            if let Err(err) = kv.zrem(&sem_key, &job_id).await {
                tracing::warn!(%resource_id, %job_id, error = %err, "best-effort release on drop failed");
            }
        });
    }
}

/// Per-process registry of limiter settings, keyed by `resourceId`.
pub struct Registry {
    kv: Arc<dyn KvClient>,
    entries: Mutex<IndexMap<String, Arc<LimiterEntry>>>,
    update_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    capacity: usize,
    cache_ttl_ms: i64,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvClient>, config: &CoreConfig) -> Self {
        Self {
            kv,
            entries: Mutex::new(IndexMap::new()),
            update_locks: Mutex::new(HashMap::new()),
            capacity: config.limiter_registry_capacity,
            cache_ttl_ms: config.limiter_cache_ttl_ms as i64,
        }
    }

    /// Current normalized settings cached for `resourceId`, if any entry exists.
    pub async fn settings(&self, resource_id: &str) -> Option<NormalizedLimiterConfig> {
        let entry = {
            let entries = self.entries.lock().await;
            entries.get(resource_id).cloned()
        };
        match entry {
            Some(entry) => Some(*entry.settings.read().await),
            None => None,
        }
    }

    pub async fn acquire(
        &self,
        resource_id: &str,
        config: &LimiterConfig,
        cancel: CancelSignal,
    ) -> CoreResult<Handle> {
        if resource_id.trim().is_empty() {
            return Err(CoreError::InvalidResourceId("resource id must not be empty".to_owned()));
        }

        let normalized = config.normalize();
        if !normalized.enabled || normalized.max_concurrency == 0 {
            return Ok(Handle::noop(resource_id.to_owned(), Arc::clone(&self.kv)));
        }

        let entry = self.get_or_create(resource_id, normalized).await;
        let settings = *entry.settings.read().await;

        let queue_key = format!("concurrency:queue:{resource_id}");
        let sem_key = format!("sem:{resource_id}");
        let job_id = next_job_id(resource_id);

        // Try the running set directly first. An idle resource must admit
        // immediately without ever being counted as a waiter — with
        // `queueSize == 0` this is the *only* way anything is ever admitted,
        // since incrementing the waiter counter unconditionally would reject
        // the very first caller against a free slot (§9: `queueSize == 0`
        // means "no queueing, reject on overflow", not "reject everyone").
        let admitted_immediately = self
            .kv
            .try_acquire_slot(&sem_key, &job_id, epoch_ms() as f64, settings.max_concurrency)
            .await?;

        if !admitted_immediately {
            let waiters = self.kv.incr_with_ttl(&queue_key, QUEUE_COUNTER_IDLE_TTL).await?;
            if waiters > settings.queue_size as i64 {
                let current_waiting =
                    self.kv.decr(&queue_key).await.unwrap_or(settings.queue_size as i64).max(0) as u32;
                return Err(CoreError::QueueFull {
                    resource_id: resource_id.to_owned(),
                    current_waiting,
                    max_queue_size: settings.queue_size,
                });
            }

            let wait_deadline = tokio::time::sleep(settings.queue_wait());
            tokio::pin!(wait_deadline);
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = self.kv.decr(&queue_key).await;
                        return Err(CoreError::ClientDisconnected { resource_id: resource_id.to_owned() });
                    }
                    _ = &mut wait_deadline => {
                        let _ = self.kv.decr(&queue_key).await;
                        return Err(CoreError::QueueWaitTimeout {
                            resource_id: resource_id.to_owned(),
                            timeout_secs: settings.queue_wait_seconds as u64,
                        });
                    }
                    _ = ticker.tick() => {
                        let admitted = self
                            .kv
                            .try_acquire_slot(&sem_key, &job_id, epoch_ms() as f64, settings.max_concurrency)
                            .await?;
                        if admitted {
                            break;
                        }
                    }
                }
            }
            let _ = self.kv.decr(&queue_key).await;
        }

        if let Some(exec_timeout) = settings.execution_timeout() {
            let _ = self.kv.expire(&sem_key, exec_timeout + EXECUTION_LEASE_GRACE).await;
        }

        let inner = Arc::new(HandleInner {
            resource_id: resource_id.to_owned(),
            job_id,
            kv: Arc::clone(&self.kv),
            released: AtomicBool::new(false),
            monitor_stop: CancellationToken::new(),
            noop: false,
        });

        let (termination_tx, termination_rx) = watch::channel(None);
        self.spawn_monitor(
            Arc::clone(&inner),
            cancel,
            resource_id.to_owned(),
            settings.execution_timeout(),
            settings.execution_seconds.unwrap_or(0),
            termination_tx,
        );

        Ok(Handle { inner, termination_rx })
    }

    /// Races the admitted handle against client disconnect and execution
    /// timeout. Either firing reports the reason on `termination_tx` — so a
    /// caller awaiting [`Handle::termination_reason`] observes the distinct
    /// `ClientDisconnected`/`ExecutionTimeout` kind instead of the slot just
    /// silently vanishing — and then releases the slot exactly once.
    fn spawn_monitor(
        &self,
        inner: Arc<HandleInner>,
        cancel: CancelSignal,
        resource_id: String,
        execution_timeout: Option<Duration>,
        execution_timeout_secs: u32,
        termination_tx: watch::Sender<Option<CoreError>>,
    ) {
        let monitor_stop = inner.monitor_stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = monitor_stop.cancelled() => {}
                _ = cancel.cancelled() => {
                    let _ = termination_tx
                        .send(Some(CoreError::ClientDisconnected { resource_id: resource_id.clone() }));
                    inner.release().await;
                }
                _ = async {
                    match execution_timeout {
                        Some(timeout) => tokio::time::sleep(timeout).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    tracing::warn!(
                        %resource_id,
                        timeout_secs = execution_timeout_secs,
                        "execution timeout; releasing slot"
                    );
                    let _ = termination_tx.send(Some(CoreError::ExecutionTimeout {
                        resource_id: resource_id.clone(),
                        timeout_secs: execution_timeout_secs as u64,
                    }));
                    inner.release().await;
                }
            }
        });
    }

    async fn get_or_create(
        &self,
        resource_id: &str,
        normalized: NormalizedLimiterConfig,
    ) -> Arc<LimiterEntry> {
        let now = epoch_ms();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.shift_remove(resource_id) {
            let stale = now - entry.last_access_ms.load(Ordering::Relaxed) > self.cache_ttl_ms;
            if !stale {
                entry.last_access_ms.store(now, Ordering::Relaxed);
                entries.insert(resource_id.to_owned(), Arc::clone(&entry));
                drop(entries);
                self.hot_reconfigure(&entry, resource_id, normalized).await;
                return entry;
            }
            // Idle past the cache TTL: treat as evicted and rebuild fresh.
            // Nothing local to dispose of — the distributed primitive lives
            // entirely in the KV store.
        }

        let entry =
            Arc::new(LimiterEntry { settings: RwLock::new(normalized), last_access_ms: AtomicI64::new(now) });
        if entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(resource_id.to_owned(), Arc::clone(&entry));
        entry
    }

    async fn update_lock_for(&self, resource_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.update_locks.lock().await;
        Arc::clone(locks.entry(resource_id.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Double-checked locking: fast path reads without blocking; the slow
    /// path serializes writers per `resourceId` and re-checks before mutating.
    async fn hot_reconfigure(
        &self,
        entry: &Arc<LimiterEntry>,
        resource_id: &str,
        normalized: NormalizedLimiterConfig,
    ) {
        {
            let current = entry.settings.read().await;
            if *current == normalized {
                return;
            }
        }
        let lock = self.update_lock_for(resource_id).await;
        let _guard = lock.lock().await;
        let mut current = entry.settings.write().await;
        if *current != normalized {
            *current = normalized;
        }
    }
}
