//! Cursor Agent (`cursor-agent -p --output-format stream-json`).

use serde_json::Value;

use crate::provider::{
    ArgsContext, ProviderEvent, ProviderSpec, content_block_events, str_field, tool_status,
    wants_full_auto,
};

pub static SPEC: ProviderSpec = ProviderSpec {
    id: "cursor",
    name: "Cursor Agent",
    binary: "cursor-agent",
    install_hint: "curl https://cursor.com/install -fsS | bash",
    supports_undo: true,
    build_args,
    map_event,
};

fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["-p", "--output-format", "stream-json"]
        .into_iter()
        .map(String::from)
        .collect();
    if let Some(model) = &ctx.options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if ctx.options.auto_level.is_none() || wants_full_auto(ctx.options) {
        args.push("--force".into());
    }
    if let Some(thread) = ctx.resume {
        args.extend(["--resume".to_string(), thread.to_string()]);
    }
    args
}

fn map_event(event: &Value) -> Vec<ProviderEvent> {
    match str_field(event, "type") {
        Some("system") if str_field(event, "subtype") == Some("init") => {
            str_field(event, "session_id")
                .map(|id| vec![ProviderEvent::ThreadId(id.to_string())])
                .unwrap_or_default()
        }
        Some("assistant") => event
            .get("message")
            .map(content_block_events)
            .unwrap_or_default(),
        Some("tool_call") if str_field(event, "subtype") == Some("started") => {
            vec![tool_status(&tool_call_name(event))]
        }
        Some("result") => {
            let failed = event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || str_field(event, "subtype").is_some_and(|s| s != "success");
            if failed {
                let reason = str_field(event, "result")
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or("Cursor Agent failed");
                vec![ProviderEvent::Error(reason.trim().to_string())]
            } else {
                vec![ProviderEvent::Completed]
            }
        }
        _ => Vec::new(),
    }
}

/// `{"tool_call": {"editToolCall": {...}}}` → `"edit"`.
fn tool_call_name(event: &Value) -> String {
    event
        .get("tool_call")
        .and_then(Value::as_object)
        .and_then(|calls| calls.keys().next())
        .map_or_else(
            || "tool".to_string(),
            |key| key.strip_suffix("ToolCall").unwrap_or(key).to_string(),
        )
}
