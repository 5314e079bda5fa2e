//! SlotQueue (C3) — per-provider admission controller.
//!
//! Concurrency + quota + reset timer + FIFO waiters, per `spec.md` §4.3.
//! Waiters are oneshot channels sitting in a `VecDeque`, guarded by a
//! `tokio::sync::Mutex`; the reset timer and each waiter's timeout are
//! independent `tokio::spawn` tasks whose `JoinHandle` is stored and
//! `.abort()`-ed on reschedule/resolve/dispose — the Rust rendering of
//! "single setTimeout-equivalent handle, idempotent scheduling" from
//! `spec.md` §9.

use super::snapshot::RateLimitSnapshot;
use crate::error::SlotQueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotQueueConfig {
    pub max_concurrency: u32,
    pub min_concurrency: u32,
    /// How long a waiter may sit in the FIFO before it's rejected. `0` disables.
    pub queue_timeout_ms: u64,
}

impl Default for SlotQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            min_concurrency: 1,
            queue_timeout_ms: 300_000,
        }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<(), SlotQueueError>>,
    timeout_handle: Option<JoinHandle<()>>,
}

struct Inner {
    max_concurrency: u32,
    min_concurrency: u32,
    active_count: u32,
    waiters: VecDeque<Waiter>,
    snapshot: RateLimitSnapshot,
    disposed: bool,
    reset_timer: Option<JoinHandle<()>>,
    next_waiter_id: u64,
}

impl Inner {
    /// `isQuotaExhausted()`. If `resetAt` has passed, clears the zeroed
    /// counters (and `resetAt` itself) and reports the quota as refreshed.
    fn is_quota_exhausted(&mut self) -> bool {
        if !self.snapshot.is_exhausted() {
            return false;
        }
        if let Some(reset_at) = self.snapshot.reset_at {
            if Utc::now() >= reset_at {
                if self.snapshot.remaining_requests == Some(0) {
                    self.snapshot.remaining_requests = None;
                }
                if self.snapshot.remaining_tokens == Some(0) {
                    self.snapshot.remaining_tokens = None;
                }
                self.snapshot.reset_at = None;
                return false;
            }
        }
        true
    }
}

enum Admission {
    Granted,
    Pending(oneshot::Receiver<Result<(), SlotQueueError>>),
}

type SlotCallback = Box<dyn Fn(usize) + Send + Sync>;

/// Admission controller for one provider. Always used behind an `Arc` —
/// background timer tasks hold a clone of it to call back into `Inner`.
pub struct SlotQueue {
    inner: Mutex<Inner>,
    config: SlotQueueConfig,
    on_slot_acquired: Option<SlotCallback>,
    on_slot_released: Option<SlotCallback>,
}

impl SlotQueue {
    pub fn new(config: SlotQueueConfig) -> Arc<Self> {
        Self::with_callbacks(config, None, None)
    }

    pub fn with_callbacks(
        config: SlotQueueConfig,
        on_slot_acquired: Option<SlotCallback>,
        on_slot_released: Option<SlotCallback>,
    ) -> Arc<Self> {
        let max_concurrency = config.max_concurrency.max(config.min_concurrency);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                max_concurrency,
                min_concurrency: config.min_concurrency,
                active_count: 0,
                waiters: VecDeque::new(),
                snapshot: RateLimitSnapshot::default(),
                disposed: false,
                reset_timer: None,
                next_waiter_id: 0,
            }),
            config,
            on_slot_acquired,
            on_slot_released,
        })
    }

    /// Suspends until a slot is granted, the wait times out, or the queue
    /// is disposed. `label` is carried only for tracing.
    pub async fn acquire(self: &Arc<Self>, label: &str) -> Result<(), SlotQueueError> {
        let span = tracing::debug_span!("slot_queue.acquire", waiter = label);
        let _enter = span.enter();
        match self.try_admit().await? {
            Admission::Granted => Ok(()),
            Admission::Pending(rx) => rx.await.unwrap_or(Err(SlotQueueError::Disposed)),
        }
    }

    async fn try_admit(self: &Arc<Self>) -> Result<Admission, SlotQueueError> {
        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return Err(SlotQueueError::Disposed);
        }

        let exhausted = inner.is_quota_exhausted();
        if !exhausted && inner.active_count < inner.max_concurrency {
            inner.active_count += 1;
            let depth = inner.waiters.len();
            tracing::debug!(
                active = inner.active_count,
                max = inner.max_concurrency,
                queue_depth = depth,
                "slot granted immediately"
            );
            if let Some(cb) = &self.on_slot_acquired {
                cb(depth);
            }
            return Ok(Admission::Granted);
        }

        let (tx, rx) = oneshot::channel();
        let waiter_id = inner.next_waiter_id;
        inner.next_waiter_id += 1;
        let schedule_reset = exhausted && inner.waiters.is_empty();
        inner.waiters.push_back(Waiter {
            id: waiter_id,
            tx,
            timeout_handle: None,
        });

        tracing::debug!(
            waiter_id,
            exhausted,
            active = inner.active_count,
            max = inner.max_concurrency,
            queue_depth = inner.waiters.len(),
            "waiter enqueued"
        );

        if schedule_reset {
            if let Some(reset_at) = inner.snapshot.reset_at {
                self.schedule_reset_locked(&mut inner, reset_at);
            }
        }

        if self.config.queue_timeout_ms > 0 {
            let queue = Arc::clone(self);
            let timeout_ms = self.config.queue_timeout_ms;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                queue.timeout_waiter(waiter_id, Duration::from_millis(timeout_ms)).await;
            });
            if let Some(w) = inner.waiters.iter_mut().find(|w| w.id == waiter_id) {
                w.timeout_handle = Some(handle);
            }
        }

        Ok(Admission::Pending(rx))
    }

    async fn timeout_waiter(self: Arc<Self>, waiter_id: u64, waited: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.waiters.iter().position(|w| w.id == waiter_id) {
            let waiter = inner.waiters.remove(pos).expect("position just found");
            tracing::warn!(waiter_id, waited_ms = waited.as_millis() as u64, "waiter timed out");
            let _ = waiter.tx.send(Err(SlotQueueError::Timeout { waited }));
        }
    }

    /// Decrements `active_count` (saturating at 0 — extra releases are
    /// tolerated per `spec.md` §8 property 3) and promotes eligible waiters.
    pub async fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        inner.active_count = inner.active_count.saturating_sub(1);
        let depth_pre_promotion = inner.waiters.len();
        tracing::debug!(active = inner.active_count, queue_depth = depth_pre_promotion, "slot released");
        self.promote_locked(&mut inner);
        drop(inner);
        if let Some(cb) = &self.on_slot_released {
            cb(depth_pre_promotion);
        }
    }

    /// Merges newer rate-limit fields in; reschedules the reset timer only
    /// if waiters are actually present, then promotes if no longer exhausted.
    pub async fn update_rate_limit_state(self: &Arc<Self>, snapshot: RateLimitSnapshot) {
        let mut inner = self.inner.lock().await;
        let old_reset = inner.snapshot.reset_at;
        inner.snapshot.merge(snapshot);
        if inner.snapshot.reset_at != old_reset && !inner.waiters.is_empty() {
            if let Some(reset_at) = inner.snapshot.reset_at {
                self.schedule_reset_locked(&mut inner, reset_at);
            }
        }
        self.promote_locked(&mut inner);
    }

    /// Zeros both counters. `retry_after_ms` of `Some(ms)` with `ms > 0`
    /// extends `reset_at` to `max(existing, now + ms)`. `None` (omitted)
    /// defaults to 60s when no `reset_at` exists. A literal `Some(0)` (or
    /// negative) is "no additional hint" and leaves `reset_at` exactly as
    /// it was — including `None` — per the Open Question resolution in
    /// `DESIGN.md`.
    pub async fn mark_rate_limited(self: &Arc<Self>, retry_after_ms: Option<i64>) {
        let mut inner = self.inner.lock().await;
        inner.snapshot.remaining_requests = Some(0);
        inner.snapshot.remaining_tokens = Some(0);

        let now = Utc::now();
        let new_reset_at = match retry_after_ms {
            Some(ms) if ms > 0 => {
                let candidate = now + chrono::Duration::milliseconds(ms);
                Some(match inner.snapshot.reset_at {
                    Some(existing) => existing.max(candidate),
                    None => candidate,
                })
            }
            Some(_zero_or_negative) => inner.snapshot.reset_at,
            None => Some(
                inner
                    .snapshot
                    .reset_at
                    .unwrap_or_else(|| now + chrono::Duration::milliseconds(60_000)),
            ),
        };
        inner.snapshot.reset_at = new_reset_at;
        tracing::warn!(reset_at = ?new_reset_at, "provider rate limited");

        if let Some(reset_at) = new_reset_at {
            if !inner.waiters.is_empty() {
                self.schedule_reset_locked(&mut inner, reset_at);
            }
        }
    }

    /// Clamps to `[min_concurrency, ∞)`. Increases promote eligible waiters;
    /// decreases never cancel in-flight work.
    pub async fn set_max_concurrency(self: &Arc<Self>, n: u32) {
        let mut inner = self.inner.lock().await;
        let clamped = n.max(inner.min_concurrency);
        let increased = clamped > inner.max_concurrency;
        inner.max_concurrency = clamped;
        if increased {
            self.promote_locked(&mut inner);
        }
    }

    /// Cancels every outstanding timer and rejects every waiter. Idempotent.
    pub async fn dispose(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        tracing::info!(pending_waiters = inner.waiters.len(), "slot queue disposed");
        if let Some(handle) = inner.reset_timer.take() {
            handle.abort();
        }
        while let Some(mut waiter) = inner.waiters.pop_front() {
            if let Some(handle) = waiter.timeout_handle.take() {
                handle.abort();
            }
            let _ = waiter.tx.send(Err(SlotQueueError::Disposed));
        }
    }

    /// Repeat while there's a head waiter, quota isn't exhausted, and a
    /// slot is free: pop, clear its timeout, increment `active_count`, and
    /// resolve it — all under the same lock, so no waiter is ever resolved
    /// without the increment (`spec.md` §4.3's atomicity requirement).
    fn promote_locked(&self, inner: &mut Inner) {
        loop {
            if inner.waiters.is_empty() {
                break;
            }
            if inner.is_quota_exhausted() {
                break;
            }
            if inner.active_count >= inner.max_concurrency {
                break;
            }
            let mut waiter = inner.waiters.pop_front().expect("checked non-empty above");
            if let Some(handle) = waiter.timeout_handle.take() {
                handle.abort();
            }
            inner.active_count += 1;
            let depth = inner.waiters.len();
            tracing::debug!(
                waiter_id = waiter.id,
                active = inner.active_count,
                queue_depth = depth,
                "waiter promoted"
            );
            let _ = waiter.tx.send(Ok(()));
            if let Some(cb) = &self.on_slot_acquired {
                cb(depth);
            }
        }
    }

    fn schedule_reset_locked(self: &Arc<Self>, inner: &mut Inner, reset_at: DateTime<Utc>) {
        if let Some(old) = inner.reset_timer.take() {
            old.abort();
        }
        let delay_ms = (reset_at - Utc::now()).num_milliseconds().max(0) as u64;
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            queue.fire_reset().await;
        });
        inner.reset_timer = Some(handle);
    }

    async fn fire_reset(self: Arc<Self>) {
        let mut inner = self.inner.lock().await;
        tracing::info!(queue_depth = inner.waiters.len(), "quota reset timer fired");
        inner.snapshot.remaining_requests = None;
        inner.snapshot.remaining_tokens = None;
        inner.snapshot.reset_at = None;
        inner.reset_timer = None;
        self.promote_locked(&mut inner);
    }

    pub async fn active_count(&self) -> u32 {
        self.inner.lock().await.active_count
    }

    pub async fn queue_depth(&self) -> usize {
        self.inner.lock().await.waiters.len()
    }

    pub async fn is_disposed(&self) -> bool {
        self.inner.lock().await.disposed
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        self.inner.lock().await.snapshot
    }
}
