use std::time::Duration;

/// Anthropic API base (the messages endpoint lives under /v1)
pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

/// Anthropic API URL for subscription usage (OAuth)
pub const ANTHROPIC_USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";

/// Anthropic OAuth token endpoint
pub const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// z.ai Anthropic-compatible API base
pub const ZAI_API_BASE: &str = "https://api.z.ai/api/anthropic";

/// MiniMax Anthropic-compatible API base
pub const MINIMAX_API_BASE: &str = "https://api.minimax.io/anthropic";

/// NanoGPT OpenAI-compatible API base
pub const NANOGPT_API_BASE: &str = "https://nano-gpt.com/api/v1";

/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// OAuth beta features header value (matches Claude Code 2.1.32)
pub const OAUTH_BETA_HEADER: &str = "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";

/// User agent string for OAuth requests (mimics Claude CLI)
pub const USER_AGENT: &str = "claude-cli/2.1.32 (external, cli)";

/// Default OAuth client id (Claude Code public client)
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Access tokens within this many ms of expiry are treated as expired
pub const TOKEN_EXPIRY_SKEW_MS: u64 = 60_000;

/// Hard cap on a token-endpoint call
pub const TOKEN_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request idle timeout (streaming LLM calls run for minutes)
pub const REQUEST_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Cap on concurrently serviced client requests
pub const MAX_IN_FLIGHT_REQUESTS: usize = 512;

/// Auto-refresh sweep interval
pub const AUTO_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Tokens expiring within this window are refreshed by the sweep
pub const AUTO_REFRESH_THRESHOLD_MS: u64 = 10 * 60 * 1000;

/// Max concurrent refreshes in one auto-refresh sweep
pub const AUTO_REFRESH_CONCURRENCY: usize = 4;

/// Vendor usage poll interval per account
pub const USAGE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Usage cache entries older than this are stale
pub const USAGE_CACHE_TTL_MS: u64 = 60_000;

/// Interval of the periodic maintenance sweep (expired oauth sessions)
pub const MAINTENANCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Writer queue high-water mark; sends apply backpressure beyond this
pub const WRITER_QUEUE_CAPACITY: usize = 1024;

/// Max jobs the writer groups into one transaction
pub const WRITER_BATCH_MAX: usize = 32;

/// How long the writer waits for a first job before re-checking shutdown
pub const WRITER_BATCH_LINGER: Duration = Duration::from_millis(50);

/// Response bodies above this are persisted as a "[streamed]" sentinel
pub const PAYLOAD_CAPTURE_CAP: usize = 512 * 1024;

/// Sentinel stored instead of over-cap streamed response bodies
pub const STREAMED_BODY_SENTINEL: &str = "[streamed]";

/// Workspaces unseen for this long are pruned by startup maintenance
pub const WORKSPACE_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Seed models for initial database population.
/// Used only on first startup when the models table is empty; the pricing
/// engine loads the table once at boot.
/// Format: (id, input_price, output_price, cache_read_price, cache_write_price) — all $/MTok
pub static SEED_MODELS: &[(&str, f64, f64, f64, f64)] = &[
    ("claude-opus-4-5", 5.0, 25.0, 0.50, 6.25),
    ("claude-opus-4-1", 15.0, 75.0, 1.50, 18.75),
    ("claude-opus-4", 15.0, 75.0, 1.50, 18.75),
    ("claude-sonnet-4-5", 3.0, 15.0, 0.30, 3.75),
    ("claude-sonnet-4", 3.0, 15.0, 0.30, 3.75),
    ("claude-haiku-4-5", 1.0, 5.0, 0.10, 1.25),
    ("claude-3-5-haiku", 0.80, 4.0, 0.08, 1.0),
    ("claude-3-5-sonnet", 3.0, 15.0, 0.30, 3.75),
    ("claude-3-opus", 15.0, 75.0, 1.50, 18.75),
];
