//! Gemini CLI (`gemini --output-format stream-json`).

use serde_json::Value;

use crate::provider::{
    ArgsContext, ProviderEvent, ProviderSpec, str_field, text_status, tool_status, wants_full_auto,
};

pub static SPEC: ProviderSpec = ProviderSpec {
    id: "gemini",
    name: "Gemini CLI",
    binary: "gemini",
    install_hint: "npm install -g @google/gemini-cli",
    supports_undo: false,
    build_args,
    map_event,
};

fn build_args(ctx: &ArgsContext<'_>) -> Vec<String> {
    let mut args = vec!["--output-format".to_string(), "stream-json".to_string()];
    if let Some(model) = &ctx.options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if wants_full_auto(ctx.options) {
        args.push("--yolo".into());
    } else {
        let mode = ctx.options.auto_level.as_deref().unwrap_or("auto_edit");
        args.extend(["--approval-mode".to_string(), mode.to_string()]);
    }
    if let Some(thread) = ctx.resume {
        args.extend(["--resume".to_string(), thread.to_string()]);
    }
    args
}

fn map_event(event: &Value) -> Vec<ProviderEvent> {
    match str_field(event, "type") {
        Some("init") => str_field(event, "session_id")
            .map(|id| vec![ProviderEvent::ThreadId(id.to_string())])
            .unwrap_or_default(),
        Some("message") if str_field(event, "role") == Some("assistant") => {
            str_field(event, "content")
                .and_then(text_status)
                .into_iter()
                .collect()
        }
        Some("tool_use") => vec![tool_status(
            str_field(event, "tool_name").unwrap_or("tool"),
        )],
        Some("result") => match str_field(event, "status") {
            Some("success") => vec![ProviderEvent::Completed],
            _ => {
                let reason = event
                    .get("error")
                    .and_then(|e| str_field(e, "message"))
                    .unwrap_or("Gemini CLI failed");
                vec![ProviderEvent::Error(reason.to_string())]
            }
        },
        _ => Vec::new(),
    }
}
