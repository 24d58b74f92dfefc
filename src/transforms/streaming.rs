//! Streaming tee and usage extraction.
//!
//! Upstream bytes are forwarded to the client verbatim; every chunk is also
//! fed to a line-reassembling SSE parser that accumulates token usage and
//! the model id from `message_start` / `message_delta` / `message_stop`
//! events. When the stream ends, or the client disconnects mid-stream,
//! exactly one request record and one payload record go to the async writer.
//!
//! The tee never buffers unboundedly: the parser consumes lines and drops
//! them, and the payload capture buffer stops at a fixed cap, after which
//! the persisted body is a `"[streamed]"` sentinel.

use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::constants::{PAYLOAD_CAPTURE_CAP, STREAMED_BODY_SENTINEL};
use crate::pricing::PricingTable;
use crate::usage::Usage;
use crate::writer::{DbWriter, PayloadRecord, RequestRecord, WriteJob};

/// Everything the tee needs to emit telemetry once the stream is over.
pub struct TelemetryContext {
    pub writer: DbWriter,
    pub pricing: Arc<PricingTable>,
    pub request_id: String,
    pub timestamp: u64,
    pub method: String,
    pub path: String,
    pub account_id: String,
    pub account_name: String,
    pub failover_attempts: u32,
    pub agent_used: Option<String>,
    /// Model from the request body; the stream's `message_start` overrides it
    pub model: Option<String>,
    pub request_headers_json: Option<String>,
    pub request_body_b64: Option<String>,
    pub started: Instant,
}

// ============================================================================
// SSE usage parser
// ============================================================================

/// Reassembles SSE lines across arbitrary chunk boundaries and extracts
/// usage/model from Anthropic stream events.
#[derive(Default)]
pub struct SseUsageParser {
    buffer: String,
    pub usage: Usage,
    pub model: Option<String>,
}

impl SseUsageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim().to_string();
            self.buffer.drain(..=newline_pos);
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };
        if data == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    if let Some(model) = message.get("model").and_then(|m| m.as_str()) {
                        self.model = Some(model.to_string());
                    }
                    if let Some(usage) = message.get("usage") {
                        self.usage.add(&Usage::from_json(usage));
                    }
                }
            }
            Some("message_delta") | Some("message_stop") => {
                if let Some(usage) = event.get("usage") {
                    self.usage.add(&Usage::from_json(usage));
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Telemetry accumulation + drop guard
// ============================================================================

struct StreamTelemetry {
    ctx: TelemetryContext,
    parser: SseUsageParser,
    first_chunk: Option<Instant>,
    last_chunk: Option<Instant>,
    captured: Vec<u8>,
    capture_overflow: bool,
    response_status: u16,
    response_headers_json: Option<String>,
}

impl StreamTelemetry {
    fn on_chunk(&mut self, chunk: &Bytes) {
        let now = Instant::now();
        if self.first_chunk.is_none() {
            self.first_chunk = Some(now);
        }
        self.last_chunk = Some(now);

        self.parser.feed(chunk);

        if !self.capture_overflow {
            if self.captured.len() + chunk.len() > PAYLOAD_CAPTURE_CAP {
                self.capture_overflow = true;
                self.captured.clear();
            } else {
                self.captured.extend_from_slice(chunk);
            }
        }
    }

    fn into_jobs(self, success: bool, error: Option<String>) -> (WriteJob, WriteJob) {
        let usage = self.parser.usage;
        let model = self.parser.model.or(self.ctx.model);

        let cost_usd = model
            .as_deref()
            .map(|m| self.ctx.pricing.cost(m, &usage))
            .unwrap_or(0.0);

        // Tokens/sec only when both timestamps exist and time actually passed
        let output_tokens_per_second = match (self.first_chunk, self.last_chunk) {
            (Some(first), Some(last)) => {
                let secs = last.duration_since(first).as_secs_f64();
                (secs > 0.0 && usage.output_tokens > 0)
                    .then(|| usage.output_tokens as f64 / secs)
            }
            _ => None,
        };

        let response_body_b64 = if self.capture_overflow {
            Some(STREAMED_BODY_SENTINEL.to_string())
        } else if self.captured.is_empty() {
            None
        } else {
            Some(BASE64.encode(&self.captured))
        };

        let request = WriteJob::InsertRequest(RequestRecord {
            id: self.ctx.request_id.clone(),
            timestamp: self.ctx.timestamp,
            method: self.ctx.method,
            path: self.ctx.path,
            account_used: Some(self.ctx.account_id),
            status_code: Some(self.response_status),
            success,
            error_message: error.clone(),
            response_time_ms: self.ctx.started.elapsed().as_millis() as u64,
            failover_attempts: self.ctx.failover_attempts,
            model,
            usage,
            cost_usd,
            agent_used: self.ctx.agent_used,
            output_tokens_per_second,
        });

        let payload = WriteJob::UpsertPayload(PayloadRecord {
            request_id: self.ctx.request_id,
            request_headers_json: self.ctx.request_headers_json,
            request_body_b64: self.ctx.request_body_b64,
            response_status: Some(self.response_status),
            response_headers_json: self.response_headers_json,
            response_body_b64,
            error,
        });

        (request, payload)
    }
}

/// Ensures telemetry is written exactly once. If the stream is dropped before
/// completion (client disconnected) the Drop impl records what was observed
/// so far. Bytes reached the client, so that is a success, not an error.
struct TeeGuard {
    inner: Option<StreamTelemetry>,
    writer: DbWriter,
}

impl TeeGuard {
    fn telemetry(&mut self) -> &mut StreamTelemetry {
        self.inner.as_mut().expect("tee guard already finalized")
    }

    async fn finish(mut self, success: bool, error: Option<String>) {
        if let Some(telemetry) = self.inner.take() {
            let (request, payload) = telemetry.into_jobs(success, error);
            self.writer.enqueue(request).await;
            self.writer.enqueue(payload).await;
        }
    }
}

impl Drop for TeeGuard {
    fn drop(&mut self) {
        if let Some(telemetry) = self.inner.take() {
            let (request, payload) = telemetry.into_jobs(true, None);
            self.writer.try_enqueue(request);
            self.writer.try_enqueue(payload);
        }
    }
}

// ============================================================================
// The tee
// ============================================================================

/// Pump upstream bytes to the client while extracting usage telemetry.
///
/// The yielded byte sequence equals the upstream byte sequence; the client
/// applies its own backpressure through the returned stream, which throttles
/// the upstream read (one chunk in flight at a time, no unbounded buffering).
pub fn tee_upstream(
    upstream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    ctx: TelemetryContext,
    response_status: u16,
    response_headers_json: Option<String>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    let writer = ctx.writer.clone();
    let telemetry = StreamTelemetry {
        ctx,
        parser: SseUsageParser::new(),
        first_chunk: None,
        last_chunk: None,
        captured: Vec::new(),
        capture_overflow: false,
        response_status,
        response_headers_json,
    };

    stream! {
        use futures_util::StreamExt;

        let mut guard = TeeGuard { inner: Some(telemetry), writer };
        let mut upstream = std::pin::pin!(upstream);
        let mut upstream_error: Option<String> = None;

        loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    guard.telemetry().on_chunk(&chunk);
                    yield Ok(chunk);
                }
                Some(Err(e)) => {
                    // Upstream died mid-stream; response headers are already
                    // committed to the client, so no failover: record and bail.
                    upstream_error = Some(e.to_string());
                    break;
                }
                None => break,
            }
        }

        match upstream_error {
            Some(message) => {
                guard.finish(false, Some(message.clone())).await;
                yield Err(std::io::Error::other(message));
            }
            None => guard.finish(true, None).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_extracts_usage_and_model() {
        let mut parser = SseUsageParser::new();
        parser.feed(
            b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-opus-4\",\"usage\":{\"input_tokens\":100,\"cache_read_input_tokens\":50}}}\n\n",
        );
        parser.feed(
            b"event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":14}}\n\n",
        );
        parser.feed(
            b"event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":28}}\n\n",
        );
        parser.feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");

        assert_eq!(parser.model.as_deref(), Some("claude-opus-4"));
        assert_eq!(parser.usage.input_tokens, 100);
        assert_eq!(parser.usage.cache_read_input_tokens, Some(50));
        assert_eq!(parser.usage.output_tokens, 42);
        assert_eq!(parser.usage.total_tokens(), 192);
    }

    #[test]
    fn test_parser_handles_chunk_split_lines() {
        let mut parser = SseUsageParser::new();
        let event = b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n";
        // Split mid-JSON
        parser.feed(&event[..20]);
        parser.feed(&event[20..]);
        assert_eq!(parser.usage.output_tokens, 7);
    }

    #[test]
    fn test_parser_usage_on_message_stop() {
        let mut parser = SseUsageParser::new();
        parser.feed(
            b"data: {\"type\":\"message_stop\",\"usage\":{\"input_tokens\":100,\"cache_read_input_tokens\":50}}\n",
        );
        assert_eq!(parser.usage.input_tokens, 100);
        assert_eq!(parser.usage.cache_read_input_tokens, Some(50));
    }

    #[test]
    fn test_parser_ignores_done_and_noise() {
        let mut parser = SseUsageParser::new();
        parser.feed(b"data: [DONE]\n: keep-alive\n\nnot-sse-garbage\n");
        assert!(parser.usage.is_empty());
        assert!(parser.model.is_none());
    }

    #[test]
    fn test_parser_ignores_content_deltas() {
        let mut parser = SseUsageParser::new();
        parser.feed(
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
        );
        assert!(parser.usage.is_empty());
    }

    // ------------------------------------------------------------------
    // Tee end-to-end
    // ------------------------------------------------------------------

    use std::collections::HashMap;
    use std::time::Instant;

    use futures_util::StreamExt;

    use crate::pricing::{ModelPricing, PricingTable};
    use crate::writer::WriteJob;

    fn test_context(writer: DbWriter) -> TelemetryContext {
        let mut rates = HashMap::new();
        rates.insert(
            "claude-opus-4".to_string(),
            ModelPricing {
                input_price: 15.0,
                output_price: 75.0,
                cache_read_price: 1.50,
                cache_write_price: 18.75,
            },
        );
        TelemetryContext {
            writer,
            pricing: Arc::new(PricingTable::from_rates(rates)),
            request_id: "req-tee".to_string(),
            timestamp: 1_000,
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            account_id: "acct-1".to_string(),
            account_name: "primary".to_string(),
            failover_attempts: 1,
            agent_used: None,
            model: None,
            request_headers_json: None,
            request_body_b64: None,
            started: Instant::now(),
        }
    }

    fn sse_chunks() -> Vec<Result<Bytes, std::io::Error>> {
        vec![
            Ok(Bytes::from(
                "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-opus-4\",\"usage\":{\"input_tokens\":100,\"cache_read_input_tokens\":50}}}\n\n",
            )),
            Ok(Bytes::from(
                "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n\n",
            )),
            Ok(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            )),
        ]
    }

    #[tokio::test]
    async fn test_tee_preserves_bytes_and_records_telemetry() {
        let (writer, mut rx) = crate::writer::test_writer(16);
        let ctx = test_context(writer.clone());

        let expected: Vec<u8> = sse_chunks()
            .iter()
            .flat_map(|c| c.as_ref().unwrap().to_vec())
            .collect();

        let teed: Vec<Bytes> = tee_upstream(
            futures_util::stream::iter(sse_chunks()),
            ctx,
            200,
            Some("{}".to_string()),
        )
        .map(|r| r.unwrap())
        .collect()
        .await;

        let forwarded: Vec<u8> = teed.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(forwarded, expected);

        let request = rx.recv().await.unwrap().job;
        let WriteJob::InsertRequest(record) = request else {
            panic!("expected InsertRequest first");
        };
        assert_eq!(record.id, "req-tee");
        assert!(record.success);
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.model.as_deref(), Some("claude-opus-4"));
        assert_eq!(record.usage.input_tokens, 100);
        assert_eq!(record.usage.cache_read_input_tokens, Some(50));
        assert_eq!(record.usage.output_tokens, 42);
        assert_eq!(record.usage.total_tokens(), 192);
        assert_eq!(record.failover_attempts, 1);
        let expected_cost =
            100.0 / 1e6 * 15.0 + 42.0 / 1e6 * 75.0 + 50.0 / 1e6 * 1.50;
        assert!((record.cost_usd - expected_cost).abs() < 1e-12);

        let payload = rx.recv().await.unwrap().job;
        let WriteJob::UpsertPayload(payload) = payload else {
            panic!("expected UpsertPayload second");
        };
        assert_eq!(payload.request_id, "req-tee");
        let stored = BASE64
            .decode(payload.response_body_b64.unwrap())
            .unwrap();
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn test_tee_client_disconnect_records_partial() {
        let (writer, mut rx) = crate::writer::test_writer(16);
        let ctx = test_context(writer.clone());

        let mut tee = Box::pin(tee_upstream(
            futures_util::stream::iter(sse_chunks()),
            ctx,
            200,
            None,
        ));
        // Client reads the first two chunks, then goes away
        tee.next().await.unwrap().unwrap();
        tee.next().await.unwrap().unwrap();
        drop(tee);

        let request = rx.recv().await.unwrap().job;
        let WriteJob::InsertRequest(record) = request else {
            panic!("expected InsertRequest first");
        };
        // Bytes reached the client, so the partial record is a success
        assert!(record.success);
        assert!(record.error_message.is_none());
        assert_eq!(record.usage.input_tokens, 100);
        assert_eq!(record.usage.output_tokens, 42);
    }

    #[tokio::test]
    async fn test_tee_upstream_failure_records_error() {
        let (writer, mut rx) = crate::writer::test_writer(16);
        let ctx = test_context(writer.clone());

        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(
                "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n",
            )),
            Err(std::io::Error::other("connection reset")),
        ];
        let teed: Vec<Result<Bytes, std::io::Error>> =
            tee_upstream(futures_util::stream::iter(chunks), ctx, 200, None)
                .collect()
                .await;
        assert!(teed.last().unwrap().is_err());

        let request = rx.recv().await.unwrap().job;
        let WriteJob::InsertRequest(record) = request else {
            panic!("expected InsertRequest first");
        };
        assert!(!record.success);
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap()
                .contains("connection reset")
        );
        assert_eq!(record.usage.output_tokens, 5);
    }

    #[tokio::test]
    async fn test_tee_capture_cap_stores_sentinel() {
        let (writer, mut rx) = crate::writer::test_writer(16);
        let ctx = test_context(writer.clone());

        let big = vec![b'a'; PAYLOAD_CAPTURE_CAP + 1];
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from(big))];
        let _: Vec<_> = tee_upstream(futures_util::stream::iter(chunks), ctx, 200, None)
            .collect()
            .await;

        let _request = rx.recv().await.unwrap().job;
        let payload = rx.recv().await.unwrap().job;
        let WriteJob::UpsertPayload(payload) = payload else {
            panic!("expected UpsertPayload second");
        };
        assert_eq!(
            payload.response_body_b64.as_deref(),
            Some(STREAMED_BODY_SENTINEL)
        );
    }
}
