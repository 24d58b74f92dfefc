//! OpenAI-compatible provider format conversion.
//!
//! Clients always speak the Anthropic Messages protocol. For providers whose
//! wire format is OpenAI chat-completions, the request body is converted on
//! the way out and the response converted back, so the client never sees the
//! upstream's native shape. Streaming responses are converted chunk-by-chunk
//! into Anthropic SSE events before the telemetry tee sees them.

use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};

const DEFAULT_MAX_TOKENS: u64 = 16000;

// ============================================================================
// Request: Anthropic → OpenAI
// ============================================================================

/// Convert an Anthropic Messages request body into OpenAI chat-completions
/// shape, substituting the (already mapped) upstream model id.
pub fn anthropic_to_openai_request(body: &Value, upstream_model: &str) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    // Anthropic `system` becomes a leading system message
    match body.get("system") {
        Some(Value::String(text)) if !text.is_empty() => {
            messages.push(json!({"role": "system", "content": text}));
        }
        Some(Value::Array(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n\n");
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text}));
            }
        }
        _ => {}
    }

    for message in body
        .get("messages")
        .and_then(|m| m.as_array())
        .into_iter()
        .flatten()
    {
        convert_anthropic_message(message, &mut messages);
    }

    let mut out = json!({
        "model": upstream_model,
        "messages": messages,
        "max_tokens": body.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_MAX_TOKENS),
    });
    let obj = out.as_object_mut().expect("literal object");

    for field in ["temperature", "top_p", "stream"] {
        if let Some(v) = body.get(field) {
            obj.insert(field.to_string(), v.clone());
        }
    }
    // Usage arrives in the final chunk only when asked for
    if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
        obj.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
    if let Some(stops) = body.get("stop_sequences") {
        obj.insert("stop".to_string(), stops.clone());
    }
    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let converted: Vec<Value> = tools.iter().map(anthropic_tool_to_openai).collect();
        obj.insert("tools".to_string(), Value::Array(converted));
    }

    out
}

fn anthropic_tool_to_openai(tool: &Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.get("name").cloned().unwrap_or(Value::Null),
            "description": tool.get("description").cloned().unwrap_or(Value::Null),
            "parameters": tool.get("input_schema").cloned().unwrap_or(json!({"type": "object"})),
        }
    })
}

/// One Anthropic message may fan out into several OpenAI messages
/// (tool_result blocks become separate `tool` role messages).
fn convert_anthropic_message(message: &Value, out: &mut Vec<Value>) {
    let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");

    match message.get("content") {
        Some(Value::String(text)) => {
            out.push(json!({"role": role, "content": text}));
        }
        Some(Value::Array(blocks)) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();

            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        tool_calls.push(json!({
                            "id": block.get("id").cloned().unwrap_or(Value::Null),
                            "type": "function",
                            "function": {
                                "name": block.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": block
                                    .get("input")
                                    .map(|i| i.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            }
                        }));
                    }
                    Some("tool_result") => {
                        let content = match block.get("content") {
                            Some(Value::String(s)) => s.clone(),
                            Some(Value::Array(parts)) => parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                .collect::<Vec<_>>()
                                .join("\n"),
                            _ => String::new(),
                        };
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                            "content": content,
                        }));
                    }
                    _ => {}
                }
            }

            if !text_parts.is_empty() || !tool_calls.is_empty() {
                let mut msg = json!({"role": role});
                let obj = msg.as_object_mut().expect("literal object");
                obj.insert(
                    "content".to_string(),
                    if text_parts.is_empty() {
                        Value::Null
                    } else {
                        Value::String(text_parts.join("\n"))
                    },
                );
                if !tool_calls.is_empty() {
                    obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
                }
                out.push(msg);
            }
        }
        _ => {}
    }
}

// ============================================================================
// Response: OpenAI → Anthropic (non-streaming)
// ============================================================================

pub fn map_finish_reason(finish: &str) -> &'static str {
    match finish {
        "stop" => "end_turn",
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

/// Convert an OpenAI chat-completion response into an Anthropic Messages
/// response. The reported `model` is the id the client asked for, not the
/// upstream's mapped id.
pub fn openai_to_anthropic_response(resp: &Value, client_model: &str) -> Value {
    let choice = resp
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let message = choice.and_then(|c| c.get("message"));

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .filter(|t| !t.is_empty())
    {
        content.push(json!({"type": "text", "text": text}));
    }
    for call in message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|t| t.as_array())
        .into_iter()
        .flatten()
    {
        let arguments = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|a| a.as_str())
            .unwrap_or("{}");
        let input: Value = serde_json::from_str(arguments).unwrap_or(json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": call
                .get("function")
                .and_then(|f| f.get("name"))
                .cloned()
                .unwrap_or(Value::Null),
            "input": input,
        }));
    }

    let stop_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|f| f.as_str())
        .map(map_finish_reason)
        .unwrap_or("end_turn");

    let usage = resp.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": resp.get("id").cloned().unwrap_or_else(|| json!("msg_unknown")),
        "type": "message",
        "role": "assistant",
        "model": client_model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        }
    })
}

// ============================================================================
// Response: OpenAI → Anthropic (streaming)
// ============================================================================

fn sse(event: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

/// Convert an OpenAI SSE stream into Anthropic SSE events.
///
/// Emits `message_start` on the first chunk, text deltas as
/// `content_block_delta`, tool-call argument fragments as
/// `input_json_delta`, then `message_delta` (stop reason + usage) and
/// `message_stop`. The downstream telemetry tee parses these converted
/// events exactly like a native Anthropic stream.
pub fn stream_openai_to_anthropic(
    body: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    client_model: String,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        use futures_util::StreamExt;

        let mut body = std::pin::pin!(body);
        let mut buffer = String::new();
        let mut started = false;
        let mut block_open = false;
        let mut block_index: u64 = 0;
        let mut stop_reason: Option<String> = None;
        let mut usage: Option<Value> = None;

        'outer: loop {
            let Some(chunk_result) = body.next().await else {
                break;
            };
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim().to_string();
                buffer.drain(..=newline_pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };

                if !started {
                    started = true;
                    yield Ok(sse("message_start", &json!({
                        "type": "message_start",
                        "message": {
                            "id": event.get("id").cloned().unwrap_or_else(|| json!("msg_stream")),
                            "type": "message",
                            "role": "assistant",
                            "model": client_model.as_str(),
                            "content": [],
                            "usage": {"input_tokens": 0, "output_tokens": 0}
                        }
                    })));
                }

                if let Some(u) = event.get("usage").filter(|u| !u.is_null()) {
                    usage = Some(json!({
                        "input_tokens": u.get("prompt_tokens").cloned().unwrap_or(json!(0)),
                        "output_tokens": u.get("completion_tokens").cloned().unwrap_or(json!(0)),
                    }));
                }

                let Some(choice) = event
                    .get("choices")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                else {
                    continue;
                };

                if let Some(finish) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                    stop_reason = Some(map_finish_reason(finish).to_string());
                }

                let Some(delta) = choice.get("delta") else {
                    continue;
                };

                if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                    if !block_open {
                        block_open = true;
                        yield Ok(sse("content_block_start", &json!({
                            "type": "content_block_start",
                            "index": block_index,
                            "content_block": {"type": "text", "text": ""}
                        })));
                    }
                    yield Ok(sse("content_block_delta", &json!({
                        "type": "content_block_delta",
                        "index": block_index,
                        "delta": {"type": "text_delta", "text": text}
                    })));
                }

                for call in delta
                    .get("tool_calls")
                    .and_then(|t| t.as_array())
                    .into_iter()
                    .flatten()
                {
                    if let Some(function) = call.get("function") {
                        if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                            if block_open {
                                yield Ok(sse("content_block_stop", &json!({
                                    "type": "content_block_stop",
                                    "index": block_index
                                })));
                                block_index += 1;
                            }
                            block_open = true;
                            yield Ok(sse("content_block_start", &json!({
                                "type": "content_block_start",
                                "index": block_index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": call.get("id").cloned().unwrap_or(Value::Null),
                                    "name": name,
                                    "input": {}
                                }
                            })));
                        }
                        if let Some(arguments) =
                            function.get("arguments").and_then(|a| a.as_str())
                        {
                            if !arguments.is_empty() {
                                yield Ok(sse("content_block_delta", &json!({
                                    "type": "content_block_delta",
                                    "index": block_index,
                                    "delta": {"type": "input_json_delta", "partial_json": arguments}
                                })));
                            }
                        }
                    }
                }
            }
        }

        if block_open {
            yield Ok(sse("content_block_stop", &json!({
                "type": "content_block_stop",
                "index": block_index
            })));
        }

        let mut delta_event = json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": stop_reason.unwrap_or_else(|| "end_turn".to_string()),
                "stop_sequence": Value::Null
            }
        });
        if let Some(u) = usage {
            delta_event
                .as_object_mut()
                .expect("literal object")
                .insert("usage".to_string(), u);
        }
        yield Ok(sse("message_delta", &delta_event));
        yield Ok(sse("message_stop", &json!({"type": "message_stop"})));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_conversion_basics() {
        let body = json!({
            "model": "claude-sonnet-4",
            "system": "Be terse.",
            "messages": [{"role": "user", "content": "hello"}],
            "max_tokens": 512,
            "temperature": 0.5,
            "stream": true
        });
        let out = anthropic_to_openai_request(&body, "gpt-4o");
        assert_eq!(out["model"], "gpt-4o");
        assert_eq!(out["messages"][0]["role"], "system");
        assert_eq!(out["messages"][0]["content"], "Be terse.");
        assert_eq!(out["messages"][1]["content"], "hello");
        assert_eq!(out["max_tokens"], 512);
        assert_eq!(out["temperature"], 0.5);
        assert_eq!(out["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_request_tool_conversion() {
        let body = json!({
            "messages": [],
            "tools": [{
                "name": "get_weather",
                "description": "Weather lookup",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
            }]
        });
        let out = anthropic_to_openai_request(&body, "gpt-4o");
        let tool = &out["tools"][0];
        assert_eq!(tool["type"], "function");
        assert_eq!(tool["function"]["name"], "get_weather");
        assert!(tool["function"]["parameters"]["properties"]["city"].is_object());
    }

    #[test]
    fn test_tool_result_becomes_tool_role() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_1",
                    "content": "sunny"
                }]
            }]
        });
        let out = anthropic_to_openai_request(&body, "gpt-4o");
        assert_eq!(out["messages"][0]["role"], "tool");
        assert_eq!(out["messages"][0]["tool_call_id"], "toolu_1");
        assert_eq!(out["messages"][0]["content"], "sunny");
    }

    #[test]
    fn test_assistant_tool_use_becomes_tool_calls() {
        let body = json!({
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Oslo"}}
                ]
            }]
        });
        let out = anthropic_to_openai_request(&body, "gpt-4o");
        let msg = &out["messages"][0];
        assert_eq!(msg["content"], "checking");
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "get_weather");
        let args: Value =
            serde_json::from_str(msg["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
                .unwrap();
        assert_eq!(args["city"], "Oslo");
    }

    #[test]
    fn test_response_conversion() {
        let resp = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4}
        });
        let out = openai_to_anthropic_response(&resp, "claude-sonnet-4");
        assert_eq!(out["type"], "message");
        assert_eq!(out["model"], "claude-sonnet-4");
        assert_eq!(out["content"][0]["text"], "hi there");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["input_tokens"], 12);
        assert_eq!(out["usage"]["output_tokens"], 4);
    }

    #[test]
    fn test_response_tool_call_conversion() {
        let resp = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let out = openai_to_anthropic_response(&resp, "claude-sonnet-4");
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(out["content"][0]["type"], "tool_use");
        assert_eq!(out["content"][0]["input"]["city"], "Oslo");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("content_filter"), "end_turn");
    }

    #[tokio::test]
    async fn test_stream_conversion_text_and_usage() {
        use futures_util::StreamExt;

        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(
                "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n",
            )),
            Ok(Bytes::from(
                "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            )),
            Ok(Bytes::from(
                "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
            )),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ];
        let upstream = futures_util::stream::iter(chunks);
        let converted: Vec<Bytes> =
            stream_openai_to_anthropic(upstream, "claude-sonnet-4".to_string())
                .map(|r| r.unwrap())
                .collect()
                .await;

        let text: String = converted
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(text.contains("message_start"));
        assert!(text.contains("\"text_delta\",\"text\":\"hel\"") || text.contains("hel"));
        assert!(text.contains("message_delta"));
        assert!(text.contains("\"input_tokens\":9"));
        assert!(text.contains("message_stop"));

        // The converted stream must satisfy the telemetry parser
        let mut parser = crate::transforms::streaming::SseUsageParser::new();
        for chunk in &converted {
            parser.feed(chunk);
        }
        assert_eq!(parser.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(parser.usage.input_tokens, 9);
        assert_eq!(parser.usage.output_tokens, 2);
    }
}
