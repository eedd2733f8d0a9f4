//! Claude Code (`claude -p --output-format stream-json`).
//!
//! Output is JSONL: a `system`/`init` line carrying the session id, then
//! `assistant` messages with content blocks, and a final `result` line.

use serde_json::Value;

use crate::provider::{
    ArgsContext, ProviderEvent, ProviderSpec, content_block_events, str_field, wants_full_auto,
};

pub static SPEC: ProviderSpec = ProviderSpec {
    id: "claude",
    name: "Claude Code",
    binary: "claude",
    install_hint: "npm install -g @anthropic-ai/claude-code",
    supports_undo: true,
    build_args,
    map_event,
};

fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["-p", "--output-format", "stream-json", "--verbose"]
        .into_iter()
        .map(String::from)
        .collect();

    if let Some(model) = &ctx.options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }

    if wants_full_auto(ctx.options) {
        args.push("--dangerously-skip-permissions".into());
    } else {
        let mode = ctx.options.auto_level.as_deref().unwrap_or("acceptEdits");
        args.extend(["--permission-mode".to_string(), mode.to_string()]);
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
        Some("result") => {
            let failed = event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                || str_field(event, "subtype").is_some_and(|s| s != "success");
            if failed {
                let reason = str_field(event, "result")
                    .filter(|r| !r.trim().is_empty())
                    .map_or_else(
                        || {
                            format!(
                                "Claude Code failed: {}",
                                str_field(event, "subtype").unwrap_or("unknown error")
                            )
                        },
                        |r| r.trim().to_string(),
                    );
                vec![ProviderEvent::Error(reason)]
            } else {
                vec![ProviderEvent::Completed]
            }
        }
        _ => Vec::new(),
    }
}
