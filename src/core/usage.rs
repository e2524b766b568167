//! Usage accounting: per-request token counters, the accounting guard that
//! fires on every exit path, and the async recorder that persists usage
//! records and issues the atomic quota increment.
//!
//! Mirrors the batching-writer shape used elsewhere in the stack: an MPSC
//! channel feeds a writer task that flushes batched INSERTs; dropping the
//! sender on shutdown flushes the remaining buffer.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Counters
// ============================================================================

/// Token counters shared between the serving path (snooper or stream
/// translator) and the accounting guard. Additive: Anthropic streaming
/// reports input and output tokens in separate events, OpenAI in a single
/// end-of-response usage object, and both sum correctly under `+=`.
#[derive(Debug, Default)]
pub struct UsageCounters {
    prompt: AtomicI64,
    completion: AtomicI64,
}

impl UsageCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_prompt(&self, n: i64) {
        self.prompt.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_completion(&self, n: i64) {
        self.completion.fetch_add(n, Ordering::Relaxed);
    }

    pub fn prompt_tokens(&self) -> i64 {
        self.prompt.load(Ordering::Relaxed)
    }

    pub fn completion_tokens(&self) -> i64 {
        self.completion.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Usage Record
// ============================================================================

/// One append-only usage record per pipeline request.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub principal_id: i64,
    pub service_name: String,
    pub upstream_model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration_ms: i64,
    pub status: i32,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Accounting Guard
// ============================================================================

/// Captures request identity and counters at routing time and emits the
/// usage record when dropped. Ownership moves into the response body stream,
/// so the drop fires on every exit path: normal completion, upstream error,
/// and client disconnect mid-stream.
pub struct AccountingGuard {
    principal_id: i64,
    service_name: String,
    upstream_model: String,
    counters: Arc<UsageCounters>,
    start: Instant,
    success: bool,
}

impl AccountingGuard {
    pub fn new(
        principal_id: i64,
        service_name: impl Into<String>,
        upstream_model: impl Into<String>,
        counters: Arc<UsageCounters>,
    ) -> Self {
        AccountingGuard {
            principal_id,
            service_name: service_name.into(),
            upstream_model: upstream_model.into(),
            counters,
            start: Instant::now(),
            success: false,
        }
    }

    /// Mark the request successful. Must be called before the guard drops;
    /// anything else records as a failure.
    pub fn mark_success(&mut self) {
        self.success = true;
    }
}

impl Drop for AccountingGuard {
    fn drop(&mut self) {
        let record = UsageRecord {
            principal_id: self.principal_id,
            service_name: std::mem::take(&mut self.service_name),
            upstream_model: std::mem::take(&mut self.upstream_model),
            prompt_tokens: self.counters.prompt_tokens(),
            completion_tokens: self.counters.completion_tokens(),
            duration_ms: self.start.elapsed().as_millis().min(i64::MAX as u128) as i64,
            status: if self.success { 200 } else { 500 },
            success: self.success,
            created_at: Utc::now(),
        };
        record_usage(record);
    }
}

// ============================================================================
// Recorder
// ============================================================================

const BATCH_SIZE: usize = 50;
const CHANNEL_CAPACITY: usize = 1024;

pub struct UsageRecorder {
    tx: mpsc::Sender<UsageRecord>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl UsageRecorder {
    pub fn new(pool: PgPool) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(Self::writer_task(rx, pool, done_tx));
        Self {
            tx,
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    pub fn record(&self, record: UsageRecord) {
        if let Err(e) = self.tx.try_send(record) {
            tracing::warn!("Usage channel full, dropping record: {}", e);
        }
    }

    async fn writer_task(
        mut rx: mpsc::Receiver<UsageRecord>,
        pool: PgPool,
        done_tx: oneshot::Sender<()>,
    ) {
        let mut buffer: Vec<UsageRecord> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));

        loop {
            tokio::select! {
                Some(record) = rx.recv() => {
                    buffer.push(record);
                    if buffer.len() >= BATCH_SIZE {
                        Self::flush(&pool, &mut buffer).await;
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        Self::flush(&pool, &mut buffer).await;
                    }
                }
                else => {
                    // Channel closed: flush remaining records
                    if !buffer.is_empty() {
                        Self::flush(&pool, &mut buffer).await;
                    }
                    break;
                }
            }
        }

        tracing::info!("Usage recorder writer task stopped");
        let _ = done_tx.send(());
    }

    async fn flush(pool: &PgPool, buffer: &mut Vec<UsageRecord>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len();
        let cols = 8;
        let mut sql = String::from(
            "INSERT INTO usage_records (\
             principal_id, service_name, upstream_model, \
             prompt_tokens, completion_tokens, duration_ms, status, created_at\
             ) VALUES ",
        );

        for i in 0..count {
            if i > 0 {
                sql.push_str(", ");
            }
            let base = i * cols + 1;
            sql.push('(');
            for j in 0..cols {
                if j > 0 {
                    sql.push_str(", ");
                }
                sql.push('$');
                sql.push_str(&(base + j).to_string());
            }
            sql.push(')');
        }

        let mut query = sqlx::query(&sql);
        let mut quota_updates: Vec<(i64, i64)> = Vec::new();

        for record in buffer.drain(..) {
            if record.success && record.principal_id > 0 {
                quota_updates.push((
                    record.principal_id,
                    record.prompt_tokens + record.completion_tokens,
                ));
            }

            query = query
                .bind(record.principal_id)
                .bind(record.service_name)
                .bind(record.upstream_model)
                .bind(record.prompt_tokens)
                .bind(record.completion_tokens)
                .bind(record.duration_ms)
                .bind(record.status)
                .bind(record.created_at);
        }

        if let Err(e) = query.execute(pool).await {
            tracing::error!("Failed to flush usage records: {}", e);
        }

        // The increment must stay a single SQL expression: concurrent
        // requests for the same principal race under read-modify-write.
        for (principal_id, delta) in quota_updates {
            let result =
                sqlx::query("UPDATE principals SET used_amount = used_amount + $1 WHERE id = $2")
                    .bind(delta as f64)
                    .bind(principal_id)
                    .execute(pool)
                    .await;
            if let Err(e) = result {
                tracing::error!(
                    principal_id = principal_id,
                    "Failed to increment used_amount: {}",
                    e
                );
            }
        }
    }
}

// Mutex<Option<…>> allows shutdown to take (drop) the sender, triggering
// the writer's final flush.
static USAGE_RECORDER: OnceLock<Mutex<Option<UsageRecorder>>> = OnceLock::new();

/// Initialize the global usage recorder with a database pool.
pub fn init_usage_recorder(pool: PgPool) {
    let recorder = UsageRecorder::new(pool);
    USAGE_RECORDER.get_or_init(|| Mutex::new(Some(recorder)));
    tracing::info!("Usage recorder initialized");
}

/// Enqueue a usage record. A no-op when the recorder is not initialized
/// (unit tests, bootstrap before the database is up).
pub fn record_usage(record: UsageRecord) {
    tracing::debug!(
        service = %record.service_name,
        prompt_tokens = record.prompt_tokens,
        completion_tokens = record.completion_tokens,
        status = record.status,
        duration_ms = record.duration_ms,
        "Request accounted"
    );
    if let Some(mutex) = USAGE_RECORDER.get() {
        if let Ok(guard) = mutex.lock() {
            if let Some(ref recorder) = *guard {
                recorder.record(record);
            }
        }
    }
}

/// Graceful shutdown: drops the sender so the writer flushes its buffer,
/// then waits for the writer to confirm.
pub async fn shutdown_usage_recorder() {
    if let Some(mutex) = USAGE_RECORDER.get() {
        let (taken, done_rx) = {
            let mut guard = mutex.lock().unwrap_or_else(|e| e.into_inner());
            let recorder = guard.take();
            let rx = recorder
                .as_ref()
                .and_then(|r| r.done_rx.lock().ok().and_then(|mut d| d.take()));
            (recorder, rx)
        };
        if taken.is_some() {
            drop(taken);
            if let Some(rx) = done_rx {
                let _ = tokio::time::timeout(std::time::Duration::from_secs(5), rx).await;
            }
            tracing::info!("Usage recorder shut down");
        }
    }
}
