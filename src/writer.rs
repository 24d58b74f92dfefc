//! Async database writer.
//!
//! All hot-path mutations are typed jobs on a bounded single-consumer queue.
//! The consumer groups jobs into one transaction (up to a batch cap, with a
//! short linger) so proxy latency never waits on disk. A failing job is
//! logged with its payload and skipped; the writer never stops for it, and
//! write failures never surface to the proxy hot path.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use turso::Connection;

use crate::constants::{WRITER_BATCH_LINGER, WRITER_BATCH_MAX, WRITER_QUEUE_CAPACITY};
use crate::db;
use crate::usage::Usage;

/// One completed (or finally failed) request, written exactly once.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp: u64,
    pub method: String,
    pub path: String,
    pub account_used: Option<String>,
    pub status_code: Option<u16>,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_time_ms: u64,
    pub failover_attempts: u32,
    pub model: Option<String>,
    pub usage: Usage,
    pub cost_usd: f64,
    pub agent_used: Option<String>,
    pub output_tokens_per_second: Option<f64>,
}

/// Raw request/response bodies and headers, keyed by request id.
#[derive(Debug, Clone)]
pub struct PayloadRecord {
    pub request_id: String,
    pub request_headers_json: Option<String>,
    pub request_body_b64: Option<String>,
    pub response_status: Option<u16>,
    pub response_headers_json: Option<String>,
    pub response_body_b64: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum WriteJob {
    InsertRequest(RequestRecord),
    UpsertPayload(PayloadRecord),
    /// New access token (+ rotated refresh token, atomically) after a refresh.
    UpdateAccountTokens {
        account_id: String,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: u64,
    },
    /// Force a refresh on next use (upstream 401/403).
    InvalidateAccessToken {
        account_id: String,
    },
    /// One served request: session + LRU bookkeeping.
    UpdateAccountUsage {
        account_id: String,
        now: u64,
        new_session: bool,
    },
    SetRateLimit {
        account_id: String,
        until: u64,
        status: String,
        remaining: Option<i64>,
        reset: Option<u64>,
    },
    ClearRateLimit {
        account_id: String,
    },
    PauseAccount {
        account_id: String,
    },
    ResumeAccount {
        account_id: String,
    },
    /// Permanent refresh failure (invalid_grant); operator must re-authenticate.
    MarkTokenInvalid {
        account_id: String,
    },
    /// Client API key served a request.
    TouchApiKey {
        key_id: String,
        now: u64,
    },
}

pub(crate) struct Envelope {
    pub(crate) job: WriteJob,
    pub(crate) ack: Option<oneshot::Sender<()>>,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct DbWriter {
    tx: mpsc::Sender<Envelope>,
}

impl DbWriter {
    /// Enqueue a job. Applies brief backpressure when the queue is at its
    /// high-water mark; a closed queue (shutdown already started) only logs.
    pub async fn enqueue(&self, job: WriteJob) {
        if let Err(e) = self.tx.send(Envelope { job, ack: None }).await {
            warn!("Writer queue closed; dropping job: {:?}", e.0.job);
        }
    }

    /// Enqueue a job and receive a commit acknowledgement, for callers that
    /// must re-read the committed row (write-through read-back).
    pub async fn enqueue_acked(&self, job: WriteJob) -> Option<oneshot::Receiver<()>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        match self
            .tx
            .send(Envelope {
                job,
                ack: Some(ack_tx),
            })
            .await
        {
            Ok(()) => Some(ack_rx),
            Err(e) => {
                warn!("Writer queue closed; dropping acked job: {:?}", e.0.job);
                None
            }
        }
    }

    /// Non-blocking enqueue for contexts that cannot await (drop guards).
    pub fn try_enqueue(&self, job: WriteJob) {
        if let Err(e) = self.tx.try_send(Envelope { job, ack: None }) {
            warn!("Writer queue full or closed; dropping job: {e}");
        }
    }
}

/// Running writer task; join to drain on shutdown.
pub struct WriterHandle {
    handle: JoinHandle<()>,
}

impl WriterHandle {
    /// Wait for the consumer to drain the queue and flush. All `DbWriter`
    /// clones must be dropped first or this waits forever.
    pub async fn drain(self) {
        if let Err(e) = self.handle.await {
            error!("Writer task panicked: {e}");
        }
    }
}

/// Spawn the single consumer. Returns the producer handle and the join handle.
pub fn spawn() -> (DbWriter, WriterHandle) {
    let (tx, rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
    let handle = tokio::spawn(consumer_loop(rx));
    (DbWriter { tx }, WriterHandle { handle })
}

/// Producer handle wired to a bare channel instead of the consumer, so tests
/// can assert on the exact jobs the hot path enqueues.
#[cfg(test)]
pub(crate) fn test_writer(capacity: usize) -> (DbWriter, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DbWriter { tx }, rx)
}

async fn consumer_loop(mut rx: mpsc::Receiver<Envelope>) {
    let mut committed: u64 = 0;
    while let Some(batch) = next_batch(&mut rx).await {
        let acks: Vec<oneshot::Sender<()>> = {
            let (jobs, acks): (Vec<WriteJob>, Vec<Option<oneshot::Sender<()>>>) =
                batch.into_iter().map(|e| (e.job, e.ack)).unzip();
            committed += jobs.len() as u64;
            commit_batch(&jobs).await;
            acks.into_iter().flatten().collect()
        };
        for ack in acks {
            let _ = ack.send(());
        }
    }
    info!("Writer drained after {committed} jobs");
}

/// Collect the next transaction's worth of jobs: block for the first job,
/// then linger briefly for more, up to the batch cap. None once the channel
/// is closed and empty.
async fn next_batch(rx: &mut mpsc::Receiver<Envelope>) -> Option<Vec<Envelope>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    while batch.len() < WRITER_BATCH_MAX {
        match timeout(WRITER_BATCH_LINGER, rx.recv()).await {
            Ok(Some(envelope)) => batch.push(envelope),
            // Channel closed: commit what we have; the outer loop exits next.
            Ok(None) => break,
            Err(_) => break,
        }
    }
    Some(batch)
}

async fn commit_batch(jobs: &[WriteJob]) {
    let conn = match db::get_conn().await {
        Ok(c) => c,
        Err(e) => {
            error!("Writer cannot reach database, dropping {} jobs: {e}", jobs.len());
            return;
        }
    };

    let in_tx = conn.execute("BEGIN", ()).await.is_ok();
    for job in jobs {
        if let Err(e) = apply_job(&conn, job).await {
            warn!("Write job failed (continuing): {e}; job: {job:?}");
        }
    }
    if in_tx {
        if let Err(e) = conn.execute("COMMIT", ()).await {
            error!("Writer commit failed for {} jobs: {e}", jobs.len());
            let _ = conn.execute("ROLLBACK", ()).await;
        }
    }
    debug!("Writer committed {} jobs", jobs.len());
}

async fn apply_job(conn: &Connection, job: &WriteJob) -> Result<(), turso::Error> {
    match job {
        WriteJob::InsertRequest(r) => {
            // Core row first, detail columns in follow-up updates (all inside
            // the surrounding batch transaction)
            conn.execute(
                "INSERT INTO requests (id, timestamp, method, path, account_used, status_code, success) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    r.id.as_str(),
                    r.timestamp as i64,
                    r.method.as_str(),
                    r.path.as_str(),
                    r.account_used.as_deref(),
                    r.status_code.map(|s| s as i64),
                    r.success as i64,
                ),
            )
            .await?;
            conn.execute(
                "UPDATE requests SET error_message = ?, response_time_ms = ?, failover_attempts = ?, \
                 model = ?, agent_used = ?, output_tokens_per_second = ? WHERE id = ?",
                (
                    r.error_message.as_deref(),
                    r.response_time_ms as i64,
                    r.failover_attempts as i64,
                    r.model.as_deref(),
                    r.agent_used.as_deref(),
                    r.output_tokens_per_second,
                    r.id.as_str(),
                ),
            )
            .await?;
            conn.execute(
                "UPDATE requests SET input_tokens = ?, cache_read_input_tokens = ?, \
                 cache_creation_input_tokens = ?, output_tokens = ?, total_tokens = ?, cost_usd = ? \
                 WHERE id = ?",
                (
                    r.usage.input_tokens as i64,
                    r.usage.cache_read_input_tokens.unwrap_or(0) as i64,
                    r.usage.cache_creation_input_tokens.unwrap_or(0) as i64,
                    r.usage.output_tokens as i64,
                    r.usage.total_tokens() as i64,
                    r.cost_usd,
                    r.id.as_str(),
                ),
            )
            .await?;
        }
        WriteJob::UpsertPayload(p) => {
            conn.execute(
                "INSERT OR REPLACE INTO request_payloads (request_id, request_headers_json, \
                 request_body_b64, response_status, response_headers_json, response_body_b64, error) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    p.request_id.as_str(),
                    p.request_headers_json.as_deref(),
                    p.request_body_b64.as_deref(),
                    p.response_status.map(|s| s as i64),
                    p.response_headers_json.as_deref(),
                    p.response_body_b64.as_deref(),
                    p.error.as_deref(),
                ),
            )
            .await?;
        }
        WriteJob::UpdateAccountTokens {
            account_id,
            access_token,
            refresh_token,
            expires_at,
        } => {
            // Rotated refresh token lands in the same statement as the access
            // token; the old refresh token is already dead upstream.
            match refresh_token {
                Some(refresh) => {
                    conn.execute(
                        "UPDATE accounts SET access_token = ?, refresh_token = ?, expires_at = ?, token_invalid = 0 WHERE id = ?",
                        (
                            access_token.as_str(),
                            refresh.as_str(),
                            *expires_at as i64,
                            account_id.as_str(),
                        ),
                    )
                    .await?;
                }
                None => {
                    conn.execute(
                        "UPDATE accounts SET access_token = ?, expires_at = ?, token_invalid = 0 WHERE id = ?",
                        (access_token.as_str(), *expires_at as i64, account_id.as_str()),
                    )
                    .await?;
                }
            }
        }
        WriteJob::InvalidateAccessToken { account_id } => {
            conn.execute(
                "UPDATE accounts SET access_token = NULL, expires_at = NULL WHERE id = ?",
                [account_id.as_str()],
            )
            .await?;
        }
        WriteJob::UpdateAccountUsage {
            account_id,
            now,
            new_session,
        } => {
            if *new_session {
                conn.execute(
                    "UPDATE accounts SET session_start = ?, session_request_count = 1, \
                     last_used = ?, request_count = request_count + 1, \
                     total_requests = total_requests + 1 WHERE id = ?",
                    (*now as i64, *now as i64, account_id.as_str()),
                )
                .await?;
            } else {
                conn.execute(
                    "UPDATE accounts SET session_request_count = session_request_count + 1, \
                     last_used = ?, request_count = request_count + 1, \
                     total_requests = total_requests + 1 WHERE id = ?",
                    (*now as i64, account_id.as_str()),
                )
                .await?;
            }
        }
        WriteJob::SetRateLimit {
            account_id,
            until,
            status,
            remaining,
            reset,
        } => {
            conn.execute(
                "UPDATE accounts SET rate_limited_until = ?, rate_limit_status = ?, \
                 rate_limit_remaining = ?, rate_limit_reset = ? WHERE id = ?",
                (
                    *until as i64,
                    status.as_str(),
                    *remaining,
                    reset.map(|r| r as i64),
                    account_id.as_str(),
                ),
            )
            .await?;
        }
        WriteJob::ClearRateLimit { account_id } => {
            conn.execute(
                "UPDATE accounts SET rate_limited_until = NULL, rate_limit_status = NULL, \
                 rate_limit_remaining = NULL, rate_limit_reset = NULL WHERE id = ?",
                [account_id.as_str()],
            )
            .await?;
        }
        WriteJob::PauseAccount { account_id } => {
            conn.execute(
                "UPDATE accounts SET paused = 1 WHERE id = ?",
                [account_id.as_str()],
            )
            .await?;
        }
        WriteJob::ResumeAccount { account_id } => {
            conn.execute(
                "UPDATE accounts SET paused = 0 WHERE id = ?",
                [account_id.as_str()],
            )
            .await?;
        }
        WriteJob::MarkTokenInvalid { account_id } => {
            conn.execute(
                "UPDATE accounts SET token_invalid = 1, access_token = NULL, expires_at = NULL WHERE id = ?",
                [account_id.as_str()],
            )
            .await?;
        }
        WriteJob::TouchApiKey { key_id, now } => {
            conn.execute(
                "UPDATE api_keys SET last_used = ?, usage_count = usage_count + 1 WHERE id = ?",
                (*now as i64, key_id.as_str()),
            )
            .await?;
        }
    }
    Ok(())
}
