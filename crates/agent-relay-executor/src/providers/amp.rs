//! Amp (`amp --execute --stream-json`).
//!
//! Amp's stream-json output follows the Claude Code shape. Follow-ups go
//! through `amp threads continue <id>`.

use serde_json::Value;

use crate::provider::{
    ArgsContext, ProviderEvent, ProviderSpec, content_block_events, str_field, wants_full_auto,
};

pub static SPEC: ProviderSpec = ProviderSpec {
    id: "amp",
    name: "Amp",
    binary: "amp",
    install_hint: "npm install -g @sourcegraph/amp",
    supports_undo: false,
    build_args,
    map_event,
};

fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(thread) = ctx.resume {
        args.extend(["threads", "continue", thread].map(String::from));
    }
    args.extend(["--execute", "--stream-json"].map(String::from));
    if ctx.options.auto_level.is_none() || wants_full_auto(ctx.options) {
        args.push("--dangerously-allow-all".into());
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
        Some("result") => {
            if str_field(event, "subtype") == Some("success")
                && !event
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            {
                vec![ProviderEvent::Completed]
            } else {
                let reason = str_field(event, "error")
                    .or_else(|| str_field(event, "result"))
                    .unwrap_or("Amp failed");
                vec![ProviderEvent::Error(reason.to_string())]
            }
        }
        _ => Vec::new(),
    }
}
