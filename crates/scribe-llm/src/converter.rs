use serde_json::{json, Value};

use scribe_core::context::LlmContext;
use scribe_core::messages::Message;
use scribe_core::provider::StreamOptions;
use scribe_core::tools::ToolDefinition;

/// Convert an `LlmContext` into an OpenAI-compatible chat-completions body.
pub fn build_request_body(
    context: &LlmContext,
    options: &StreamOptions,
    model: &str,
    default_temperature: Option<f64>,
) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "messages": convert_messages(context),
    });

    if let Some(temp) = options.temperature.or(default_temperature) {
        body["temperature"] = json!(temp);
    }
    if let Some(max) = options.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if !context.tools.is_empty() {
        body["tools"] = Value::Array(context.tools.iter().map(convert_tool).collect());
    }

    body
}

fn convert_messages(context: &LlmContext) -> Vec<Value> {
    let mut out = Vec::with_capacity(context.messages.len() + 1);
    if !context.system_prompt.is_empty() {
        out.push(json!({"role": "system", "content": context.system_prompt}));
    }

    for message in &context.messages {
        let value = match message {
            Message::User { content } => json!({"role": "user", "content": content}),
            Message::Assistant { content, tool_calls } if tool_calls.is_empty() => {
                json!({"role": "assistant", "content": content})
            }
            Message::Assistant { content, tool_calls } => {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                let content = if content.is_empty() {
                    Value::Null
                } else {
                    json!(content)
                };
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            Message::Tool {
                tool_call_id,
                content,
            } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
        };
        out.push(value);
    }
    out
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters_schema,
        }
    })
}
