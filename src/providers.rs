//! Provider capability set.
//!
//! Each account is bound to one provider. The provider decides the default
//! upstream endpoint, how credentials are sent, whether tokens can be
//! refreshed, and whether the request body needs format conversion.

use serde::{Deserialize, Serialize};

use crate::constants::{ANTHROPIC_API_BASE, MINIMAX_API_BASE, NANOGPT_API_BASE, ZAI_API_BASE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    AnthropicOauth,
    ClaudeConsole,
    Zai,
    Minimax,
    AnthropicCompatible,
    OpenaiCompatible,
    Nanogpt,
    VertexAi,
}

/// How credentials are attached to upstream requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthHeader {
    /// `authorization: Bearer <token>`
    Bearer,
    /// `x-api-key: <key>`
    XApiKey,
}

/// Upstream request body wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Anthropic Messages API shape, passed through unchanged
    Anthropic,
    /// OpenAI chat-completions shape; Anthropic-format requests are converted
    Openai,
}

impl Provider {
    pub fn parse(tag: &str) -> Option<Provider> {
        match tag {
            "anthropic-oauth" => Some(Provider::AnthropicOauth),
            "claude-console" => Some(Provider::ClaudeConsole),
            "zai" => Some(Provider::Zai),
            "minimax" => Some(Provider::Minimax),
            "anthropic-compatible" => Some(Provider::AnthropicCompatible),
            "openai-compatible" => Some(Provider::OpenaiCompatible),
            "nanogpt" => Some(Provider::Nanogpt),
            "vertex-ai" => Some(Provider::VertexAi),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Provider::AnthropicOauth => "anthropic-oauth",
            Provider::ClaudeConsole => "claude-console",
            Provider::Zai => "zai",
            Provider::Minimax => "minimax",
            Provider::AnthropicCompatible => "anthropic-compatible",
            Provider::OpenaiCompatible => "openai-compatible",
            Provider::Nanogpt => "nanogpt",
            Provider::VertexAi => "vertex-ai",
        }
    }

    /// Whether this provider's credentials are OAuth tokens refreshed via the
    /// vendor token endpoint. API-key providers skip expiry bookkeeping.
    pub fn supports_oauth(&self) -> bool {
        matches!(self, Provider::AnthropicOauth)
    }

    /// Whether the vendor exposes a usage endpoint worth polling.
    pub fn supports_usage_tracking(&self) -> bool {
        matches!(self, Provider::AnthropicOauth)
    }

    /// Whether selector session affinity matters for this provider's billing.
    pub fn requires_session_tracking(&self) -> bool {
        matches!(self, Provider::AnthropicOauth | Provider::ClaudeConsole)
    }

    /// Default endpoint base. None means `custom_endpoint` is required.
    pub fn default_endpoint(&self) -> Option<&'static str> {
        match self {
            Provider::AnthropicOauth | Provider::ClaudeConsole => Some(ANTHROPIC_API_BASE),
            Provider::Zai => Some(ZAI_API_BASE),
            Provider::Minimax => Some(MINIMAX_API_BASE),
            Provider::Nanogpt => Some(NANOGPT_API_BASE),
            Provider::AnthropicCompatible | Provider::OpenaiCompatible | Provider::VertexAi => None,
        }
    }

    pub fn auth_header(&self) -> AuthHeader {
        match self {
            Provider::AnthropicOauth | Provider::VertexAi => AuthHeader::Bearer,
            Provider::OpenaiCompatible | Provider::Nanogpt => AuthHeader::Bearer,
            Provider::ClaudeConsole
            | Provider::Zai
            | Provider::Minimax
            | Provider::AnthropicCompatible => AuthHeader::XApiKey,
        }
    }

    pub fn wire_format(&self) -> WireFormat {
        match self {
            Provider::OpenaiCompatible | Provider::Nanogpt => WireFormat::Openai,
            _ => WireFormat::Anthropic,
        }
    }

    /// Whether the OAuth beta headers are sent on upstream requests.
    pub fn sends_oauth_betas(&self) -> bool {
        matches!(self, Provider::AnthropicOauth)
    }
}
