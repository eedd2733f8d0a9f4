//! OpenCode (`opencode run --format json`).
//!
//! Every event carries the `sessionID`; parts hold text and tool state.

use serde_json::Value;

use crate::provider::{
    ArgsContext, ProviderEvent, ProviderSpec, str_field, text_status, tool_status,
};

pub static SPEC: ProviderSpec = ProviderSpec {
    id: "opencode",
    name: "OpenCode",
    binary: "opencode",
    install_hint: "npm install -g opencode-ai",
    supports_undo: false,
    build_args,
    map_event,
};

fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--format".to_string(), "json".to_string()];
    if let Some(model) = &ctx.options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if let Some(thread) = ctx.resume {
        args.extend(["--session".to_string(), thread.to_string()]);
    }
    args
}

fn map_event(event: &Value) -> Vec<ProviderEvent> {
    let mut events: Vec<ProviderEvent> = str_field(event, "sessionID")
        .map(|id| ProviderEvent::ThreadId(id.to_string()))
        .into_iter()
        .collect();
    let part = event.get("part");

    match str_field(event, "type") {
        Some("text") => {
            events.extend(part.and_then(|p| str_field(p, "text")).and_then(text_status));
        }
        Some("tool_use") => {
            let tool = part.and_then(|p| str_field(p, "tool")).unwrap_or("tool");
            events.push(tool_status(tool));
        }
        Some("step_finish") if part.and_then(|p| str_field(p, "reason")) == Some("stop") => {
            events.push(ProviderEvent::Completed);
        }
        Some("error") => {
            let error = event.get("error");
            let reason = error
                .and_then(|e| e.get("data"))
                .and_then(|d| str_field(d, "message"))
                .or_else(|| error.and_then(|e| str_field(e, "name")))
                .unwrap_or("OpenCode failed");
            events.push(ProviderEvent::Error(reason.to_string()));
        }
        _ => {}
    }
    events
}
