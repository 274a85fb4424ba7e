//! Batched, out-of-band delivery of captured log entries.
//!
//! [`BatchTransport`] decouples request handling from the ingest API. Entries
//! are appended to an in-memory queue and shipped in batches, either when the
//! queue reaches `batch_size` or on a periodic timer.
//!
//! Delivery is at-least-once within a retry budget: failed batches are put
//! back at the front of the queue, and entries that have failed
//! `max_retries` times are dropped. A circuit breaker stops all network
//! attempts for a cooldown after repeated consecutive failures. Nothing here
//! ever reports back to the request path.

mod breaker;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tollgate::log::{LogBatch, LogEntry, LogSink};
use url::Url;

use crate::error::TransportError;
use breaker::CircuitBreaker;

/// Delivery settings for a [`BatchTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ingest endpoint receiving `POST`ed batches.
    pub ingest_url: Url,
    /// Bearer token for the ingest API.
    pub api_key: String,
    /// Service identity stamped on every batch.
    pub agent_id: String,
    /// Queue length that triggers an immediate flush, and the largest batch posted.
    pub batch_size: usize,
    /// Period of the background flush timer.
    pub flush_interval: Duration,
    /// Delivery attempts per entry before it is dropped.
    pub max_retries: u32,
    /// Queue bound; the oldest entries are dropped beyond it.
    pub max_buffered_entries: usize,
    /// Consecutive failed flushes that open the circuit.
    pub breaker_threshold: u32,
    /// How long an open circuit refuses delivery.
    pub breaker_cooldown: Duration,
    /// Timeout for each ingest request.
    pub request_timeout: Duration,
}

impl TransportConfig {
    /// Default [`batch_size`](Self::batch_size).
    pub const DEFAULT_BATCH_SIZE: usize = 50;
    /// Default [`flush_interval`](Self::flush_interval).
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
    /// Default [`max_retries`](Self::max_retries).
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default [`max_buffered_entries`](Self::max_buffered_entries).
    pub const DEFAULT_MAX_BUFFERED: usize = 10_000;
    /// Default [`breaker_threshold`](Self::breaker_threshold).
    pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
    /// Default [`breaker_cooldown`](Self::breaker_cooldown).
    pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
    /// Default [`request_timeout`](Self::request_timeout).
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a config with default limits.
    #[must_use]
    pub fn new(ingest_url: Url, api_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            ingest_url,
            api_key: api_key.into(),
            agent_id: agent_id.into(),
            batch_size: Self::DEFAULT_BATCH_SIZE,
            flush_interval: Self::DEFAULT_FLUSH_INTERVAL,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            max_buffered_entries: Self::DEFAULT_MAX_BUFFERED,
            breaker_threshold: Self::DEFAULT_BREAKER_THRESHOLD,
            breaker_cooldown: Self::DEFAULT_BREAKER_COOLDOWN,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the batch size. Zero is treated as one.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the flush timer period.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the per-entry retry budget. Zero is treated as one.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Sets the queue bound.
    #[must_use]
    pub fn with_max_buffered_entries(mut self, max: usize) -> Self {
        self.max_buffered_entries = max.max(1);
        self
    }

    /// Sets the breaker threshold and cooldown.
    #[must_use]
    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold.max(1);
        self.breaker_cooldown = cooldown;
        self
    }

    /// Sets the ingest request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Point-in-time counters for a [`BatchTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Entries waiting in the queue.
    pub buffered: usize,
    /// Calls to [`BatchTransport::flush`], including timer-driven ones.
    pub flush_calls: u64,
    /// Entries acknowledged by the ingest API.
    pub sent: u64,
    /// Entries dropped by the queue bound or the retry budget.
    pub dropped: u64,
    /// Current run of failed deliveries.
    pub consecutive_failures: u32,
    /// Whether the breaker currently refuses delivery.
    pub circuit_open: bool,
}

#[derive(Debug)]
struct Pending {
    entry: LogEntry,
    attempts: u32,
}

#[derive(Debug)]
struct State {
    buffer: VecDeque<Pending>,
    breaker: CircuitBreaker,
    /// Set by `close`. Guarded by the same lock as `buffer` so no entry can
    /// land after the final flush took the queue.
    closed: bool,
}

#[derive(Debug)]
struct Timer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct Inner {
    config: TransportConfig,
    client: reqwest::Client,
    state: Mutex<State>,
    timer: Mutex<Option<Timer>>,
    tasks: TaskTracker,
    flush_calls: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<Timer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap-to-clone handle to a shared delivery queue.
///
/// One transport is created per service instance and cloned into every
/// layer that produces entries.
#[derive(Clone)]
pub struct BatchTransport {
    inner: Arc<Inner>,
}

impl fmt::Debug for BatchTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchTransport")
            .field("ingest_url", &self.inner.config.ingest_url.as_str())
            .field("agent_id", &self.inner.config.agent_id)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BatchTransport {
    /// Creates a transport. No background work starts until
    /// [`start_auto_flush`](Self::start_auto_flush) is called.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        Self {
            inner: Arc::new(Inner {
                config,
                client: reqwest::Client::new(),
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    breaker,
                    closed: false,
                }),
                timer: Mutex::new(None),
                tasks: TaskTracker::new(),
                flush_calls: AtomicU64::new(0),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the delivery settings.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Enqueues an entry. Never blocks on network I/O.
    ///
    /// Reaching `batch_size` hands the whole queue to a background delivery,
    /// unless the circuit is open. After [`close`](Self::close) this is a no-op.
    pub fn add(&self, entry: LogEntry) {
        let config = &self.inner.config;
        let runtime = Handle::try_current().ok();
        let mut state = self.inner.lock_state();
        if state.closed {
            tracing::debug!(request_id = %entry.request_id, "transport closed, discarding log entry");
            return;
        }
        state.buffer.push_back(Pending { entry, attempts: 0 });
        let overflow = state.buffer.len().saturating_sub(config.max_buffered_entries);
        if overflow > 0 {
            state.buffer.drain(..overflow);
            self.inner.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
            tracing::error!(
                dropped = overflow,
                max_buffered = config.max_buffered_entries,
                "log buffer full, dropping oldest entries"
            );
        }
        let Some(runtime) = runtime else { return };
        if state.buffer.len() >= config.batch_size && state.breaker.try_acquire(Instant::now()) {
            let batch = std::mem::take(&mut state.buffer);
            // Spawned under the lock so `close` always waits for this delivery.
            let this = self.clone();
            self.inner.tasks.spawn_on(
                async move {
                    if let Err(err) = this.deliver(batch).await {
                        tracing::debug!(error = %err, "size-triggered flush failed");
                    }
                },
                &runtime,
            );
        }
    }

    /// Sends everything queued, in chunks of at most `batch_size`.
    ///
    /// Returns the number of entries acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CircuitOpen`] without touching the network
    /// while the breaker is open, or the delivery error of the first chunk
    /// that failed. Unsent entries are back in the queue either way.
    pub async fn flush(&self) -> Result<usize, TransportError> {
        self.inner.flush_calls.fetch_add(1, Ordering::Relaxed);
        let batch = {
            let mut state = self.inner.lock_state();
            if state.buffer.is_empty() {
                return Ok(0);
            }
            if !state.breaker.try_acquire(Instant::now()) {
                return Err(TransportError::CircuitOpen);
            }
            std::mem::take(&mut state.buffer)
        };
        self.deliver(batch).await
    }

    /// Starts the periodic flush timer. Calling it again while a timer is
    /// running does nothing.
    pub fn start_auto_flush(&self) {
        // Checked under the timer lock, which `close` takes after setting the flag.
        let mut timer = self.inner.lock_timer();
        if timer.is_some() || self.inner.lock_state().closed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("no tokio runtime available, auto flush not started");
            return;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.flush_interval;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let transport = Self { inner };
                        if let Err(err) = transport.flush().await {
                            tracing::debug!(error = %err, "scheduled flush failed");
                        }
                    }
                }
            }
        });
        *timer = Some(Timer { cancel, handle });
        tracing::debug!(interval = ?period, "auto flush started");
    }

    /// Stops the timer, waits for in-flight deliveries, closes the circuit
    /// and performs one final flush.
    ///
    /// Later calls to [`add`](Self::add) are ignored.
    ///
    /// # Errors
    ///
    /// Returns the final flush's delivery error, if any.
    pub async fn close(&self) -> Result<usize, TransportError> {
        if std::mem::replace(&mut self.inner.lock_state().closed, true) {
            return Ok(0);
        }
        let timer = self.inner.lock_timer().take();
        if let Some(Timer { cancel, handle }) = timer {
            cancel.cancel();
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "auto flush task ended abnormally");
            }
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        self.inner.lock_state().breaker.reset();
        let result = self.flush().await;
        match &result {
            Ok(sent) => tracing::info!(sent, "transport closed"),
            Err(err) => tracing::warn!(error = %err, "final flush failed, entries lost"),
        }
        result
    }

    /// Sends a single `sdk_ping` entry to check the ingest API.
    ///
    /// Failures are logged and reported as `false`; they are never fatal.
    pub async fn verify_connection(&self) -> bool {
        let batch = LogBatch::new(&self.inner.config.agent_id, vec![LogEntry::ping()]);
        match self.post(&batch).await {
            Ok(()) => {
                tracing::info!(url = %self.inner.config.ingest_url, "ingest connection verified");
                true
            }
            Err(err) => {
                tracing::warn!(url = %self.inner.config.ingest_url, error = %err, "ingest connection check failed");
                false
            }
        }
    }

    /// Returns a snapshot of the queue and delivery counters.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        let state = self.inner.lock_state();
        TransportStats {
            buffered: state.buffer.len(),
            flush_calls: self.inner.flush_calls.load(Ordering::Relaxed),
            sent: self.inner.sent.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            consecutive_failures: state.breaker.consecutive_failures(),
            circuit_open: state.breaker.is_open(Instant::now()),
        }
    }

    /// Posts `batch` chunk by chunk. Must only be called after the breaker
    /// granted an attempt.
    async fn deliver(&self, mut batch: VecDeque<Pending>) -> Result<usize, TransportError> {
        let config = &self.inner.config;
        let mut delivered = 0;
        while !batch.is_empty() {
            let take = batch.len().min(config.batch_size);
            let (entries, attempts): (Vec<LogEntry>, Vec<u32>) = batch
                .drain(..take)
                .map(|pending| (pending.entry, pending.attempts))
                .unzip();
            let log_batch = LogBatch::new(&config.agent_id, entries);

            match self.post(&log_batch).await {
                Ok(()) => {
                    delivered += take;
                    self.inner.sent.fetch_add(take as u64, Ordering::Relaxed);
                    self.inner.lock_state().breaker.record_success();
                    tracing::debug!(batch_id = %log_batch.batch_id, entries = take, "log batch delivered");
                }
                Err(err) => {
                    self.requeue(log_batch.entries, attempts, batch);
                    tracing::warn!(batch_id = %log_batch.batch_id, error = %err, "log batch delivery failed");
                    return Err(err);
                }
            }
        }
        Ok(delivered)
    }

    /// Puts a failed chunk and the unattempted remainder back at the front of
    /// the queue, dropping entries whose retry budget is spent.
    fn requeue(&self, failed: Vec<LogEntry>, attempts: Vec<u32>, remainder: VecDeque<Pending>) {
        let config = &self.inner.config;
        let mut exhausted = 0_u64;
        let mut retry: VecDeque<Pending> = failed
            .into_iter()
            .zip(attempts)
            .filter_map(|(entry, attempts)| {
                let attempts = attempts + 1;
                if attempts >= config.max_retries {
                    exhausted += 1;
                    None
                } else {
                    Some(Pending { entry, attempts })
                }
            })
            .collect();
        retry.extend(remainder);

        let (opened, overflow) = {
            let mut state = self.inner.lock_state();
            let opened = state.breaker.record_failure(Instant::now());
            while let Some(pending) = retry.pop_back() {
                state.buffer.push_front(pending);
            }
            let overflow = state.buffer.len().saturating_sub(config.max_buffered_entries);
            state.buffer.drain(..overflow);
            (opened, overflow)
        };

        if overflow > 0 {
            self.inner.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
            tracing::error!(
                dropped = overflow,
                max_buffered = config.max_buffered_entries,
                "log buffer full after requeue, dropping oldest entries"
            );
        }
        if exhausted > 0 {
            self.inner.dropped.fetch_add(exhausted, Ordering::Relaxed);
            tracing::warn!(
                dropped = exhausted,
                max_retries = config.max_retries,
                "dropping log entries that exhausted their retries"
            );
        }
        if opened {
            tracing::warn!(
                cooldown = ?config.breaker_cooldown,
                "ingest circuit opened after consecutive failures"
            );
        }
    }

    async fn post(&self, batch: &LogBatch) -> Result<(), TransportError> {
        let config = &self.inner.config;
        let body = serde_json::to_vec(batch)?;
        let response = self
            .inner
            .client
            .post(config.ingest_url.clone())
            .bearer_auth(&config.api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(config.request_timeout)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Status { status, body })
        }
    }
}

impl LogSink for BatchTransport {
    fn add(&self, entry: LogEntry) {
        Self::add(self, entry);
    }
}
