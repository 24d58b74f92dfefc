//! The request-servicing pipeline.
//!
//! One client request: drain the body once (retries need a replayable copy),
//! select candidates, then walk the candidate list: obtain credentials,
//! rewrite headers, forward, classify. 2xx streams back through the
//! telemetry tee; 429 locks the account and fails over; 401/403 invalidates
//! the cached token and fails over; 5xx/network retries the same candidate
//! with exponential backoff before moving on; other 4xx surface verbatim.
//! Exhaustion emits a 503 with the per-account attempt summary.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::TryStreamExt;
use rand::Rng;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::{Account, AccountStore, select_candidates};
use crate::auth::{ClientKeysStore, RefreshManager};
use crate::config::RetryPolicy;
use crate::constants::{
    ANTHROPIC_VERSION, OAUTH_BETA_HEADER, PAYLOAD_CAPTURE_CAP, STREAMED_BODY_SENTINEL, USER_AGENT,
};
use crate::error::ProxyError;
use crate::pricing::PricingTable;
use crate::providers::{AuthHeader, WireFormat};
use crate::proxy::rate_limit::{ResponseClass, classify_status, parse_rate_limit};
use crate::transforms::openai_compat::{
    anthropic_to_openai_request, openai_to_anthropic_response, stream_openai_to_anthropic,
};
use crate::transforms::streaming::{TelemetryContext, tee_upstream};
use crate::usage::Usage;
use crate::usage_cache::UsageCache;
use crate::writer::{DbWriter, PayloadRecord, RequestRecord, WriteJob};

/// Headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Client headers additionally stripped before forwarding upstream.
const CLIENT_ONLY: &[&str] = &["host", "authorization", "x-api-key", "x-agent", "x-agent-model"];

/// One failed candidate, reported in the 503 summary.
#[derive(Debug, Clone, serde::Serialize)]
struct Attempt {
    account_name: String,
    error: String,
    retries: u32,
}

/// Immutable per-request facts captured before candidate iteration.
pub struct RequestContext {
    pub request_id: String,
    pub timestamp: u64,
    pub started: Instant,
    pub method: Method,
    pub path: String,
    pub path_and_query: String,
    pub agent: Option<String>,
    pub agent_model: Option<String>,
    pub requested_model: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub body_json: Option<Value>,
    pub request_headers_json: Option<String>,
}

pub struct ProxyEngine {
    pub http_client: Client,
    pub store: Arc<AccountStore>,
    pub refresh: Arc<RefreshManager>,
    pub client_keys: Arc<ClientKeysStore>,
    pub writer: DbWriter,
    pub pricing: Arc<PricingTable>,
    pub usage_cache: Arc<UsageCache>,
    pub retry: RetryPolicy,
    pub session_duration_ms: u64,
    pub default_agent_model: Option<String>,
    pub max_body_bytes: usize,
}

impl ProxyEngine {
    /// Service one `/v1/*` request end to end.
    pub async fn handle(&self, req: axum::extract::Request) -> Response {
        let started = Instant::now();
        let timestamp = now_ms();
        let request_id = Uuid::new_v4().to_string();

        let (parts, body) = req.into_parts();

        if let Err(response) = self.check_client_key(&parts.headers, timestamp).await {
            return response;
        }

        let body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(b) => b,
            Err(_) => return ProxyError::PayloadTooLarge.into_response(),
        };

        let body_json: Option<Value> = serde_json::from_slice(&body).ok();
        let ctx = RequestContext {
            request_id,
            timestamp,
            started,
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            path_and_query: parts
                .uri
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| parts.uri.path().to_string()),
            agent: header_string(&parts.headers, "x-agent"),
            agent_model: header_string(&parts.headers, "x-agent-model"),
            requested_model: body_json
                .as_ref()
                .and_then(|b| b.get("model"))
                .and_then(|m| m.as_str())
                .map(String::from),
            request_headers_json: Some(headers_to_json(&parts.headers, true)),
            headers: parts.headers,
            body,
            body_json,
        };

        self.run_candidates(ctx).await
    }

    /// Enforce client API keys when any are configured.
    async fn check_client_key(&self, headers: &HeaderMap, now: u64) -> Result<(), Response> {
        match self.client_keys.any_active().await {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => {
                warn!("Client key check unavailable: {e}");
                return Err(ProxyError::DatabaseError(e.to_string()).into_response());
            }
        }

        let presented = header_string(headers, "x-api-key").or_else(|| {
            header_string(headers, "authorization")
                .and_then(|v| v.strip_prefix("Bearer ").map(String::from))
        });
        let Some(presented) = presented else {
            return Err(ProxyError::InvalidApiKey.into_response());
        };

        match self.client_keys.verify(&presented, &self.writer, now).await {
            Ok(Some(key)) => {
                debug!("Request authorized by client key {}", key.name);
                Ok(())
            }
            Ok(None) => Err(ProxyError::InvalidApiKey.into_response()),
            Err(e) => {
                warn!("Client key verification failed: {e}");
                Err(ProxyError::DatabaseError(e.to_string()).into_response())
            }
        }
    }

    async fn run_candidates(&self, ctx: RequestContext) -> Response {
        let now = ctx.timestamp;

        let accounts = match self.store.get_all().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("Account snapshot failed: {e}");
                return e.into_response();
            }
        };
        let candidates = select_candidates(&accounts, now, self.session_duration_ms);

        if candidates.is_empty() {
            // When the whole fleet is rate-limited, tell the client when the
            // nearest lock expires
            let nearest_reset_secs = accounts
                .iter()
                .filter_map(|a| a.rate_limited_until)
                .filter(|&until| until > now)
                .map(|until| (until - now) / 1000)
                .min();
            self.record_failure(&ctx, 503, "no accounts available", 0)
                .await;
            return self.unavailable_response(&ctx, &[], nearest_reset_secs);
        }

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut nearest_retry_secs: Option<u64> = None;

        for account in &candidates {
            let effective_model = self.effective_model(account, &ctx);

            let token = match self.refresh.get_valid_access_token(account).await {
                Ok(token) => token,
                Err(e) => {
                    debug!("Skipping account {}: {e}", account.name);
                    attempts.push(Attempt {
                        account_name: account.name.clone(),
                        error: e.to_string(),
                        retries: 0,
                    });
                    continue;
                }
            };

            let Some(url) = build_upstream_url(account, &ctx.path_and_query) else {
                attempts.push(Attempt {
                    account_name: account.name.clone(),
                    error: "no endpoint configured".to_string(),
                    retries: 0,
                });
                continue;
            };

            let upstream_body = build_upstream_body(account, &ctx, effective_model.as_deref());
            let upstream_headers = build_upstream_headers(account, &ctx.headers, &token);

            let mut retries: u32 = 0;
            loop {
                let send_result = self
                    .http_client
                    .request(ctx.method.clone(), &url)
                    .headers(upstream_headers.clone())
                    .body(upstream_body.clone())
                    .send()
                    .await;

                let response = match send_result {
                    Ok(r) => r,
                    Err(e) => {
                        if retries < self.retry.attempts {
                            self.backoff(retries).await;
                            retries += 1;
                            continue;
                        }
                        attempts.push(Attempt {
                            account_name: account.name.clone(),
                            error: format!("network error: {e}"),
                            retries,
                        });
                        break;
                    }
                };

                let status = response.status().as_u16();
                match classify_status(status) {
                    ResponseClass::Success => {
                        return self
                            .emit_success(&ctx, account, response, attempts.len() as u32)
                            .await;
                    }
                    ResponseClass::AuthFailed => {
                        info!(
                            "Auth failure ({status}) on account {}; invalidating cached token",
                            account.name
                        );
                        self.writer
                            .enqueue(WriteJob::InvalidateAccessToken {
                                account_id: account.id.clone(),
                            })
                            .await;
                        attempts.push(Attempt {
                            account_name: account.name.clone(),
                            error: format!("auth failed ({status})"),
                            retries,
                        });
                        break;
                    }
                    ResponseClass::RateLimited => {
                        let limits = parse_rate_limit(response.headers(), now_ms());
                        info!(
                            "Account {} rate limited until {:?}",
                            account.name, limits.until
                        );
                        let account_retry_secs = limits
                            .retry_after_secs
                            .or_else(|| limits.until.map(|u| u.saturating_sub(now_ms()) / 1000));
                        nearest_retry_secs = match (nearest_retry_secs, account_retry_secs) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                        self.writer
                            .enqueue(WriteJob::SetRateLimit {
                                account_id: account.id.clone(),
                                until: limits.until.unwrap_or(now_ms()),
                                status: limits
                                    .status_text
                                    .unwrap_or_else(|| "rate_limited".to_string()),
                                remaining: limits.remaining,
                                reset: limits.reset,
                            })
                            .await;
                        attempts.push(Attempt {
                            account_name: account.name.clone(),
                            error: "rate limited (429)".to_string(),
                            retries,
                        });
                        break;
                    }
                    ResponseClass::ClientError => {
                        // Client mistakes don't burn accounts: surface verbatim
                        return self
                            .emit_client_error(&ctx, account, response, attempts.len() as u32)
                            .await;
                    }
                    ResponseClass::UpstreamTransient => {
                        if retries < self.retry.attempts {
                            debug!(
                                "Upstream {status} from account {}; retry {} of {}",
                                account.name,
                                retries + 1,
                                self.retry.attempts
                            );
                            self.backoff(retries).await;
                            retries += 1;
                            continue;
                        }
                        attempts.push(Attempt {
                            account_name: account.name.clone(),
                            error: format!("upstream error ({status})"),
                            retries,
                        });
                        break;
                    }
                }
            }
        }

        self.record_failure(&ctx, 503, "all accounts failed", attempts.len() as u32)
            .await;
        self.unavailable_response(&ctx, &attempts, nearest_retry_secs)
    }

    /// Exponential backoff with a little jitter so synchronized retries
    /// don't hammer a recovering upstream.
    async fn backoff(&self, attempt: u32) {
        let base = self.retry.delay_for(attempt);
        let jitter_ms = rand::rng().random_range(0..=self.retry.delay_ms / 4);
        tokio::time::sleep(base + std::time::Duration::from_millis(jitter_ms)).await;
    }

    /// Agent-driven model override. Applied only when the selected account's
    /// provider serves the override; otherwise the request's original model.
    fn effective_model(&self, account: &Account, ctx: &RequestContext) -> Option<String> {
        if ctx.agent.is_some() {
            for candidate in [ctx.agent_model.as_deref(), self.default_agent_model.as_deref()]
                .into_iter()
                .flatten()
            {
                if account.serves_model(candidate) {
                    return Some(candidate.to_string());
                }
            }
        }
        ctx.requested_model.clone()
    }

    async fn emit_success(
        &self,
        ctx: &RequestContext,
        account: &Account,
        response: reqwest::Response,
        failover_attempts: u32,
    ) -> Response {
        // Session bookkeeping: reset the affinity window if it lapsed
        let now = now_ms();
        let new_session = account.provider.requires_session_tracking()
            && !account.in_session(now, self.session_duration_ms);
        self.writer
            .enqueue(WriteJob::UpdateAccountUsage {
                account_id: account.id.clone(),
                now,
                new_session,
            })
            .await;

        let status = response.status().as_u16();
        let upstream_headers = response.headers().clone();
        let response_headers_json = Some(headers_to_json(&upstream_headers, false));

        let is_sse = upstream_headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        let telemetry = TelemetryContext {
            writer: self.writer.clone(),
            pricing: Arc::clone(&self.pricing),
            request_id: ctx.request_id.clone(),
            timestamp: ctx.timestamp,
            method: ctx.method.to_string(),
            path: ctx.path.clone(),
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            failover_attempts,
            agent_used: ctx.agent.clone(),
            model: ctx.requested_model.clone(),
            request_headers_json: ctx.request_headers_json.clone(),
            request_body_b64: Some(BASE64.encode(&ctx.body)),
            started: ctx.started,
        };

        // Usage-telemetry read-through: surface the freshest known
        // utilization for the serving account
        let utilization = self
            .usage_cache
            .get(&account.id)
            .await
            .and_then(|s| s.utilization_pct);

        if is_sse {
            let upstream = response.bytes_stream().map_err(std::io::Error::other);
            let tee: Body = match account.provider.wire_format() {
                WireFormat::Openai => {
                    let client_model = ctx
                        .requested_model
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string());
                    let converted = stream_openai_to_anthropic(upstream, client_model);
                    Body::from_stream(tee_upstream(converted, telemetry, status, response_headers_json))
                }
                WireFormat::Anthropic => {
                    Body::from_stream(tee_upstream(upstream, telemetry, status, response_headers_json))
                }
            };

            self.build_response(status, &upstream_headers, account, &ctx.request_id, utilization, tee)
        } else {
            self.emit_buffered(ctx, account, telemetry, status, upstream_headers, utilization, response)
                .await
        }
    }

    /// Non-streaming success: buffer, extract usage, convert if needed, flush.
    async fn emit_buffered(
        &self,
        ctx: &RequestContext,
        account: &Account,
        telemetry: TelemetryContext,
        status: u16,
        upstream_headers: HeaderMap,
        utilization: Option<f64>,
        response: reqwest::Response,
    ) -> Response {
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Upstream body read failed: {e}");
                self.record_failure(ctx, 502, &format!("body read failed: {e}"), telemetry.failover_attempts)
                    .await;
                return ProxyError::UpstreamTransient(e.to_string()).into_response();
            }
        };

        let parsed: Option<Value> = serde_json::from_slice(&body).ok();

        let (out_body, usage, model) = match account.provider.wire_format() {
            WireFormat::Openai => {
                let usage = parsed
                    .as_ref()
                    .and_then(|p| p.get("usage"))
                    .map(Usage::from_openai_json)
                    .unwrap_or_default();
                let client_model = ctx.requested_model.as_deref().unwrap_or("unknown");
                let converted = parsed
                    .as_ref()
                    .map(|p| openai_to_anthropic_response(p, client_model));
                let out = converted
                    .and_then(|c| serde_json::to_vec(&c).ok())
                    .map(Bytes::from)
                    .unwrap_or_else(|| body.clone());
                (out, usage, ctx.requested_model.clone())
            }
            WireFormat::Anthropic => {
                let usage = parsed
                    .as_ref()
                    .and_then(|p| p.get("usage"))
                    .map(Usage::from_json)
                    .unwrap_or_default();
                let model = parsed
                    .as_ref()
                    .and_then(|p| p.get("model"))
                    .and_then(|m| m.as_str())
                    .map(String::from)
                    .or_else(|| ctx.requested_model.clone());
                (body.clone(), usage, model)
            }
        };

        let cost_usd = model
            .as_deref()
            .map(|m| self.pricing.cost(m, &usage))
            .unwrap_or(0.0);

        let response_body_b64 = if out_body.len() > PAYLOAD_CAPTURE_CAP {
            Some(STREAMED_BODY_SENTINEL.to_string())
        } else {
            Some(BASE64.encode(&out_body))
        };

        self.writer
            .enqueue(WriteJob::InsertRequest(RequestRecord {
                id: telemetry.request_id.clone(),
                timestamp: telemetry.timestamp,
                method: telemetry.method.clone(),
                path: telemetry.path.clone(),
                account_used: Some(account.id.clone()),
                status_code: Some(status),
                success: true,
                error_message: None,
                response_time_ms: ctx.started.elapsed().as_millis() as u64,
                failover_attempts: telemetry.failover_attempts,
                model,
                usage,
                cost_usd,
                agent_used: telemetry.agent_used.clone(),
                output_tokens_per_second: None,
            }))
            .await;
        self.writer
            .enqueue(WriteJob::UpsertPayload(PayloadRecord {
                request_id: telemetry.request_id.clone(),
                request_headers_json: telemetry.request_headers_json.clone(),
                request_body_b64: telemetry.request_body_b64.clone(),
                response_status: Some(status),
                response_headers_json: Some(headers_to_json(&upstream_headers, false)),
                response_body_b64,
                error: None,
            }))
            .await;

        self.build_response(
            status,
            &upstream_headers,
            account,
            &ctx.request_id,
            utilization,
            Body::from(out_body),
        )
    }

    /// Terminal 4xx: record it and pass it through untouched.
    async fn emit_client_error(
        &self,
        ctx: &RequestContext,
        account: &Account,
        response: reqwest::Response,
        failover_attempts: u32,
    ) -> Response {
        let status = response.status().as_u16();
        let upstream_headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_default();

        self.writer
            .enqueue(WriteJob::InsertRequest(RequestRecord {
                id: ctx.request_id.clone(),
                timestamp: ctx.timestamp,
                method: ctx.method.to_string(),
                path: ctx.path.clone(),
                account_used: Some(account.id.clone()),
                status_code: Some(status),
                success: false,
                error_message: Some(format!("upstream client error ({status})")),
                response_time_ms: ctx.started.elapsed().as_millis() as u64,
                failover_attempts,
                model: ctx.requested_model.clone(),
                usage: Usage::default(),
                cost_usd: 0.0,
                agent_used: ctx.agent.clone(),
                output_tokens_per_second: None,
            }))
            .await;
        self.writer
            .enqueue(WriteJob::UpsertPayload(PayloadRecord {
                request_id: ctx.request_id.clone(),
                request_headers_json: ctx.request_headers_json.clone(),
                request_body_b64: Some(BASE64.encode(&ctx.body)),
                response_status: Some(status),
                response_headers_json: Some(headers_to_json(&upstream_headers, false)),
                response_body_b64: Some(BASE64.encode(&body)),
                error: None,
            }))
            .await;

        self.build_response(
            status,
            &upstream_headers,
            account,
            &ctx.request_id,
            None,
            Body::from(body),
        )
    }

    fn build_response(
        &self,
        status: u16,
        upstream_headers: &HeaderMap,
        account: &Account,
        request_id: &str,
        utilization: Option<f64>,
        body: Body,
    ) -> Response {
        let mut builder = Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));

        for (name, value) in upstream_headers {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        builder = builder
            .header("x-proxy-account", sanitize_header_value(&account.name))
            .header("x-request-id", request_id);
        if let Some(pct) = utilization {
            builder = builder.header("x-proxy-utilization", format!("{pct:.1}"));
        }

        builder.body(body).unwrap_or_else(|e| {
            warn!("Response build failed: {e}");
            StatusCode::BAD_GATEWAY.into_response()
        })
    }

    /// The 503 emitted on empty or exhausted candidate lists.
    fn unavailable_response(
        &self,
        ctx: &RequestContext,
        attempts: &[Attempt],
        nearest_retry_secs: Option<u64>,
    ) -> Response {
        let error = if attempts.is_empty() {
            "No accounts available"
        } else {
            "All accounts failed"
        };
        let body = json!({
            "error": error,
            "attempts": attempts,
            "request_id": ctx.request_id,
        });

        let mut builder = Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-request-id", ctx.request_id.clone());
        if let Some(secs) = nearest_retry_secs {
            builder = builder.header(header::RETRY_AFTER, secs);
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| StatusCode::SERVICE_UNAVAILABLE.into_response())
    }

    /// Audit row for requests that never produced an upstream success.
    async fn record_failure(
        &self,
        ctx: &RequestContext,
        status: u16,
        error: &str,
        failover_attempts: u32,
    ) {
        self.writer
            .enqueue(WriteJob::InsertRequest(RequestRecord {
                id: ctx.request_id.clone(),
                timestamp: ctx.timestamp,
                method: ctx.method.to_string(),
                path: ctx.path.clone(),
                account_used: None,
                status_code: Some(status),
                success: false,
                error_message: Some(error.to_string()),
                response_time_ms: ctx.started.elapsed().as_millis() as u64,
                failover_attempts,
                model: ctx.requested_model.clone(),
                usage: Usage::default(),
                cost_usd: 0.0,
                agent_used: ctx.agent.clone(),
                output_tokens_per_second: None,
            }))
            .await;
        self.writer
            .enqueue(WriteJob::UpsertPayload(PayloadRecord {
                request_id: ctx.request_id.clone(),
                request_headers_json: ctx.request_headers_json.clone(),
                request_body_b64: Some(BASE64.encode(&ctx.body)),
                response_status: Some(status),
                response_headers_json: None,
                response_body_b64: None,
                error: Some(error.to_string()),
            }))
            .await;
    }
}

// ============================================================================
// Pure request-building helpers
// ============================================================================

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Serialize headers for the payload record. Client credentials never land
/// in the store.
fn headers_to_json(headers: &HeaderMap, strip_credentials: bool) -> String {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if strip_credentials
            && matches!(name.as_str(), "authorization" | "x-api-key" | "cookie")
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_string(), Value::String(v.to_string()));
        }
    }
    Value::Object(map).to_string()
}

fn sanitize_header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

/// Upstream URL: custom/default endpoint base, preserving path and query.
/// OpenAI-wire providers get the messages path mapped to chat-completions.
fn build_upstream_url(account: &Account, path_and_query: &str) -> Option<String> {
    let base = account.endpoint()?.trim_end_matches('/');
    match account.provider.wire_format() {
        WireFormat::Anthropic => Some(format!("{base}{path_and_query}")),
        WireFormat::Openai => {
            let (path, query) = match path_and_query.split_once('?') {
                Some((p, q)) => (p, Some(q)),
                None => (path_and_query, None),
            };
            let mapped = if path == "/v1/messages" {
                "/chat/completions".to_string()
            } else {
                path.strip_prefix("/v1").unwrap_or(path).to_string()
            };
            Some(match query {
                Some(q) => format!("{base}{mapped}?{q}"),
                None => format!("{base}{mapped}"),
            })
        }
    }
}

/// Replayable upstream body for one candidate: model mapping applied, and
/// converted to the provider's wire format when it differs.
fn build_upstream_body(
    account: &Account,
    ctx: &RequestContext,
    effective_model: Option<&str>,
) -> Bytes {
    let Some(body_json) = &ctx.body_json else {
        return ctx.body.clone();
    };

    match account.provider.wire_format() {
        WireFormat::Openai => {
            let model = effective_model
                .or(ctx.requested_model.as_deref())
                .unwrap_or("unknown");
            let upstream_model = account.map_model(model).to_string();
            let converted = anthropic_to_openai_request(body_json, &upstream_model);
            Bytes::from(serde_json::to_vec(&converted).unwrap_or_else(|_| ctx.body.to_vec()))
        }
        WireFormat::Anthropic => {
            let original = ctx.requested_model.as_deref();
            let model = effective_model.or(original);
            let mapped = model.map(|m| account.map_model(m));
            // Leave the body untouched unless the model actually changes
            match (mapped, original) {
                (Some(new_model), original) if original != Some(new_model) => {
                    let mut rewritten = body_json.clone();
                    if let Some(obj) = rewritten.as_object_mut() {
                        obj.insert("model".to_string(), Value::String(new_model.to_string()));
                    }
                    Bytes::from(
                        serde_json::to_vec(&rewritten).unwrap_or_else(|_| ctx.body.to_vec()),
                    )
                }
                _ => ctx.body.clone(),
            }
        }
    }
}

/// Forwarded headers: client headers minus hop-by-hop and credentials, plus
/// the account's own credentials and provider-specific extras.
fn build_upstream_headers(account: &Account, client_headers: &HeaderMap, token: &str) -> HeaderMap {
    let mut out = HeaderMap::new();

    for (name, value) in client_headers {
        if is_hop_by_hop(name.as_str())
            || CLIENT_ONLY.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
        {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }

    match account.provider.auth_header() {
        AuthHeader::Bearer => {
            out.insert(
                header::AUTHORIZATION,
                sanitize_header_value(&format!("Bearer {token}")),
            );
        }
        AuthHeader::XApiKey => {
            out.insert(
                HeaderName::from_static("x-api-key"),
                sanitize_header_value(token),
            );
        }
    }

    if account.provider.wire_format() == WireFormat::Anthropic {
        out.entry(HeaderName::from_static("anthropic-version"))
            .or_insert(HeaderValue::from_static(ANTHROPIC_VERSION));
    }
    if account.provider.sends_oauth_betas() {
        out.insert(
            HeaderName::from_static("anthropic-beta"),
            HeaderValue::from_static(OAUTH_BETA_HEADER),
        );
        out.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    }

    out
}

fn now_ms() -> u64 {
    crate::auth::now_ms()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::test_account;
    use crate::providers::Provider;
    use std::collections::HashMap;

    #[test]
    fn test_upstream_url_anthropic_preserves_path_and_query() {
        let account = test_account("a", Provider::AnthropicOauth);
        let url = build_upstream_url(&account, "/v1/messages?beta=true").unwrap();
        assert_eq!(url, "https://api.anthropic.com/v1/messages?beta=true");
    }

    #[test]
    fn test_upstream_url_custom_endpoint() {
        let mut account = test_account("a", Provider::AnthropicCompatible);
        account.custom_endpoint = Some("https://gw.internal/".to_string());
        let url = build_upstream_url(&account, "/v1/messages").unwrap();
        assert_eq!(url, "https://gw.internal/v1/messages");
    }

    #[test]
    fn test_upstream_url_openai_maps_messages_path() {
        let account = test_account("a", Provider::Nanogpt);
        let url = build_upstream_url(&account, "/v1/messages").unwrap();
        assert_eq!(url, "https://nano-gpt.com/api/v1/chat/completions");
    }

    #[test]
    fn test_upstream_url_missing_endpoint() {
        let account = test_account("a", Provider::OpenaiCompatible);
        assert!(build_upstream_url(&account, "/v1/messages").is_none());
    }

    #[test]
    fn test_headers_strip_client_credentials() {
        let account = test_account("a", Provider::AnthropicOauth);
        let mut client = HeaderMap::new();
        client.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        client.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer client-secret"),
        );
        client.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let out = build_upstream_headers(&account, &client, "upstream-token");
        assert_eq!(
            out.get("authorization").unwrap().to_str().unwrap(),
            "Bearer upstream-token"
        );
        assert!(out.get("host").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("anthropic-beta").unwrap(), OAUTH_BETA_HEADER);
        assert_eq!(out.get("user-agent").unwrap(), USER_AGENT);
    }

    #[test]
    fn test_headers_api_key_provider() {
        let account = test_account("a", Provider::Zai);
        let out = build_upstream_headers(&account, &HeaderMap::new(), "sk-zai-123");
        assert_eq!(out.get("x-api-key").unwrap(), "sk-zai-123");
        assert!(out.get("authorization").is_none());
        assert_eq!(out.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert!(out.get("anthropic-beta").is_none());
    }

    #[test]
    fn test_headers_to_json_strips_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("secret"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let json = headers_to_json(&headers, true);
        assert!(!json.contains("secret"));
        assert!(json.contains("application/json"));
    }

    fn ctx_with_body(body: Value) -> RequestContext {
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
        RequestContext {
            request_id: "req-1".to_string(),
            timestamp: 0,
            started: Instant::now(),
            method: Method::POST,
            path: "/v1/messages".to_string(),
            path_and_query: "/v1/messages".to_string(),
            agent: None,
            agent_model: None,
            requested_model: body
                .get("model")
                .and_then(|m| m.as_str())
                .map(String::from),
            headers: HeaderMap::new(),
            body: bytes,
            body_json: Some(body),
            request_headers_json: None,
        }
    }

    #[test]
    fn test_body_untouched_without_mapping() {
        let account = test_account("a", Provider::AnthropicOauth);
        let ctx = ctx_with_body(serde_json::json!({"model": "claude-sonnet-4", "messages": []}));
        let body = build_upstream_body(&account, &ctx, None);
        assert_eq!(body, ctx.body);
    }

    #[test]
    fn test_body_model_rewritten_by_mapping() {
        let mut account = test_account("a", Provider::AnthropicCompatible);
        account.custom_endpoint = Some("https://gw.internal".to_string());
        account.model_mappings = Some(HashMap::from([(
            "claude-sonnet-4".to_string(),
            "glm-4.7".to_string(),
        )]));
        let ctx = ctx_with_body(serde_json::json!({"model": "claude-sonnet-4", "messages": []}));
        let body = build_upstream_body(&account, &ctx, Some("claude-sonnet-4"));
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["model"], "glm-4.7");
    }

    fn test_engine() -> (ProxyEngine, tokio::sync::mpsc::Receiver<crate::writer::Envelope>) {
        let (writer, rx) = crate::writer::test_writer(16);
        let engine = ProxyEngine {
            http_client: Client::new(),
            store: Arc::new(AccountStore::new()),
            refresh: Arc::new(RefreshManager::new(
                Client::new(),
                "client-id".to_string(),
                writer.clone(),
            )),
            client_keys: Arc::new(ClientKeysStore::new()),
            writer,
            pricing: Arc::new(crate::pricing::PricingTable::from_rates(HashMap::new())),
            usage_cache: Arc::new(UsageCache::new()),
            retry: RetryPolicy::default(),
            session_duration_ms: 5 * 60 * 60 * 1000,
            default_agent_model: Some("claude-haiku-4-5".to_string()),
            max_body_bytes: 1024 * 1024,
        };
        (engine, rx)
    }

    #[tokio::test]
    async fn test_unavailable_response_shape() {
        let (engine, _rx) = test_engine();
        let ctx = ctx_with_body(serde_json::json!({"model": "claude-sonnet-4"}));
        let attempts = vec![
            Attempt {
                account_name: "primary".to_string(),
                error: "rate limited (429)".to_string(),
                retries: 0,
            },
            Attempt {
                account_name: "backup".to_string(),
                error: "upstream error (500)".to_string(),
                retries: 3,
            },
        ];

        let response = engine.unavailable_response(&ctx, &attempts, Some(120));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("retry-after").unwrap(), "120");
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-1");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "All accounts failed");
        assert_eq!(parsed["request_id"], "req-1");
        assert_eq!(parsed["attempts"][0]["account_name"], "primary");
        assert_eq!(parsed["attempts"][1]["retries"], 3);
    }

    #[tokio::test]
    async fn test_no_candidates_response_shape() {
        let (engine, _rx) = test_engine();
        let ctx = ctx_with_body(serde_json::json!({}));
        let response = engine.unavailable_response(&ctx, &[], None);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("retry-after").is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "No accounts available");
        assert_eq!(parsed["attempts"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_effective_model_agent_override() {
        let (engine, _rx) = test_engine();
        let account = test_account("a", Provider::AnthropicOauth);

        let mut ctx = ctx_with_body(serde_json::json!({"model": "claude-sonnet-4"}));
        ctx.agent = Some("reviewer".to_string());
        ctx.agent_model = Some("claude-opus-4".to_string());
        assert_eq!(
            engine.effective_model(&account, &ctx).as_deref(),
            Some("claude-opus-4")
        );

        // An override the provider cannot serve falls back to the default
        // agent model, which it can
        ctx.agent_model = Some("gpt-4o".to_string());
        assert_eq!(
            engine.effective_model(&account, &ctx).as_deref(),
            Some("claude-haiku-4-5")
        );

        // Without an agent header the request's model always wins
        ctx.agent = None;
        assert_eq!(
            engine.effective_model(&account, &ctx).as_deref(),
            Some("claude-sonnet-4")
        );
    }

    #[test]
    fn test_body_converted_for_openai_wire() {
        let mut account = test_account("a", Provider::OpenaiCompatible);
        account.model_mappings = Some(HashMap::from([(
            "claude-sonnet-4".to_string(),
            "gpt-4o".to_string(),
        )]));
        let ctx = ctx_with_body(serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let body = build_upstream_body(&account, &ctx, Some("claude-sonnet-4"));
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["model"], "gpt-4o");
        assert_eq!(parsed["messages"][0]["content"], "hi");
    }
}
