//! Token usage accounting.
//!
//! One request's token counts, accumulated across streaming events or
//! parsed from a non-streaming `usage` block.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u64>,
}

impl Usage {
    /// Add another usage report to this one (useful for accumulating in streams).
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens = Some(
            self.cache_creation_input_tokens.unwrap_or(0)
                + other.cache_creation_input_tokens.unwrap_or(0),
        );
        self.cache_read_input_tokens = Some(
            self.cache_read_input_tokens.unwrap_or(0)
                + other.cache_read_input_tokens.unwrap_or(0),
        );
    }

    /// input + cache_read + cache_create + output
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens.unwrap_or(0)
            + self.cache_read_input_tokens.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }

    /// Parse usage from a JSON value (Anthropic's usage object format).
    pub fn from_json(value: &Value) -> Usage {
        Usage {
            input_tokens: value
                .get("input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: value
                .get("output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_creation_input_tokens: value
                .get("cache_creation_input_tokens")
                .and_then(|v| v.as_u64()),
            cache_read_input_tokens: value
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_u64()),
        }
    }

    /// Parse usage from an OpenAI-format `usage` block (prompt/completion naming).
    pub fn from_openai_json(value: &Value) -> Usage {
        Usage {
            input_tokens: value
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: value
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_creation_input_tokens: None,
            cache_read_input_tokens: value
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(|v| v.as_u64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_usage() {
        let mut usage1 = Usage {
            input_tokens: 100,
            output_tokens: 0,
            cache_creation_input_tokens: Some(10),
            cache_read_input_tokens: Some(50),
        };
        let usage2 = Usage {
            input_tokens: 0,
            output_tokens: 200,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        };
        usage1.add(&usage2);
        assert_eq!(usage1.input_tokens, 100);
        assert_eq!(usage1.output_tokens, 200);
        assert_eq!(usage1.cache_creation_input_tokens, Some(10));
        assert_eq!(usage1.cache_read_input_tokens, Some(50));
    }

    #[test]
    fn test_usage_from_json() {
        let json = serde_json::json!({
            "input_tokens": 100,
            "output_tokens": 50,
            "cache_creation_input_tokens": 20,
            "cache_read_input_tokens": 30
        });
        let usage = Usage::from_json(&json);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.cache_creation_input_tokens, Some(20));
        assert_eq!(usage.cache_read_input_tokens, Some(30));
        assert_eq!(usage.total_tokens(), 200);
    }

    #[test]
    fn test_usage_from_openai_json() {
        let json = serde_json::json!({
            "prompt_tokens": 80,
            "completion_tokens": 40,
            "total_tokens": 120
        });
        let usage = Usage::from_openai_json(&json);
        assert_eq!(usage.input_tokens, 80);
        assert_eq!(usage.output_tokens, 40);
        assert_eq!(usage.cache_creation_input_tokens, None);
    }

    #[test]
    fn test_total_matches_component_sum() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 42,
            cache_creation_input_tokens: Some(0),
            cache_read_input_tokens: Some(50),
        };
        assert_eq!(usage.total_tokens(), 192);
    }
}
